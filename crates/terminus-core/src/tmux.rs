//! tmux session management

use anyhow::{Context, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::TerminalConfig;

/// A key as tmux `send-keys` understands it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TmuxKey {
    /// Text typed verbatim (`send-keys -l`)
    Literal(String),
    /// A key name such as `Enter` or `C-c`
    Named(String),
}

const NAMED_KEYS: &[&str] = &[
    "Enter", "Escape", "Tab", "BTab", "BSpace", "Space", "Up", "Down", "Left", "Right", "Home",
    "End", "PageUp", "PageDown", "PPage", "NPage", "DC", "IC",
];

/// Whether `keys` is a single tmux key name rather than text
pub fn is_key_name(keys: &str) -> bool {
    if NAMED_KEYS.contains(&keys) {
        return true;
    }
    // C-x, M-x, C-M-x and function keys
    let mut rest = keys;
    let mut has_modifier = false;
    while let Some(stripped) = rest.strip_prefix("C-").or_else(|| rest.strip_prefix("M-")) {
        rest = stripped;
        has_modifier = true;
    }
    if has_modifier {
        return rest.chars().count() == 1 || NAMED_KEYS.contains(&rest);
    }
    rest.strip_prefix('F')
        .and_then(|n| n.parse::<u8>().ok())
        .map_or(false, |n| (1..=12).contains(&n))
}

/// Split keystrokes into tmux keys: newlines become `Enter`, everything else is literal
pub fn split_keys(keystrokes: &str) -> Vec<TmuxKey> {
    if is_key_name(keystrokes) {
        return vec![TmuxKey::Named(keystrokes.to_string())];
    }

    let mut keys = Vec::new();
    let mut lines = keystrokes.split('\n').peekable();
    while let Some(line) = lines.next() {
        if !line.is_empty() {
            keys.push(TmuxKey::Literal(line.to_string()));
        }
        if lines.peek().is_some() {
            keys.push(TmuxKey::Named("Enter".to_string()));
        }
    }
    keys
}

/// A detached tmux session driven through the tmux CLI
#[derive(Debug)]
pub struct TmuxSession {
    name: String,
    width: u16,
    height: u16,
    alive: bool,
}

impl TmuxSession {
    /// Create a handle without starting tmux
    pub fn new(config: &TerminalConfig) -> Self {
        let name = config
            .session_name
            .clone()
            .unwrap_or_else(|| format!("terminus-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));

        Self {
            name,
            width: config.width,
            height: config.height,
            alive: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start the detached session
    pub async fn start(&mut self) -> Result<()> {
        if self.alive {
            anyhow::bail!("tmux session {} is already running", self.name);
        }

        which_tmux().await?;

        let width = self.width.to_string();
        let height = self.height.to_string();
        run_tmux(&[
            "new-session",
            "-d",
            "-s",
            &self.name,
            "-x",
            &width,
            "-y",
            &height,
        ])
        .await
        .context("Failed to start tmux session")?;

        // Keep the whole scrollback so incremental output can be diffed
        run_tmux(&["set-option", "-t", &self.name, "history-limit", "50000"]).await?;

        self.alive = true;
        debug!(session = %self.name, "Started tmux session");
        Ok(())
    }

    /// Send a sequence of keys to the session
    pub async fn send_keys(&self, keys: &[TmuxKey]) -> Result<()> {
        for key in keys {
            match key {
                TmuxKey::Literal(text) => {
                    run_tmux(&["send-keys", "-t", &self.name, "-l", text]).await?;
                }
                TmuxKey::Named(name) => {
                    run_tmux(&["send-keys", "-t", &self.name, name]).await?;
                }
            }
        }
        Ok(())
    }

    /// Wait for `tmux wait -S <channel>`; returns false if the timeout expires first
    pub async fn wait_for(&self, channel: &str, timeout: Duration) -> Result<bool> {
        match tokio::time::timeout(timeout, run_tmux(&["wait", channel])).await {
            Ok(result) => result.map(|_| true),
            Err(_) => {
                // Unblock the waiter we abandoned
                let _ = run_tmux(&["wait", "-S", channel]).await;
                Ok(false)
            }
        }
    }

    /// Capture the visible pane
    pub async fn capture_screen(&self) -> Result<String> {
        run_tmux(&["capture-pane", "-p", "-t", &self.name]).await
    }

    /// Capture the whole scrollback
    pub async fn capture_history(&self) -> Result<String> {
        run_tmux(&["capture-pane", "-p", "-S", "-", "-t", &self.name]).await
    }

    /// Kill the session
    pub async fn stop(&mut self) -> Result<()> {
        if !self.alive {
            return Ok(());
        }
        self.alive = false;
        run_tmux(&["kill-session", "-t", &self.name])
            .await
            .context("Failed to stop tmux session")?;
        debug!(session = %self.name, "Stopped tmux session");
        Ok(())
    }
}

impl Drop for TmuxSession {
    fn drop(&mut self) {
        if self.alive {
            let result = std::process::Command::new("tmux")
                .args(["kill-session", "-t", &self.name])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            if let Err(e) = result {
                warn!(session = %self.name, error = %e, "Failed to kill tmux session");
            }
        }
    }
}

/// Check that tmux is installed
async fn which_tmux() -> Result<()> {
    Command::new("tmux")
        .arg("-V")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .context("tmux not found in PATH")?;
    Ok(())
}

async fn run_tmux(args: &[&str]) -> Result<String> {
    let output = Command::new("tmux")
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("Failed to run tmux {}", args.first().unwrap_or(&"")))?;

    if !output.status.success() {
        anyhow::bail!(
            "tmux {} failed: {}",
            args.first().unwrap_or(&""),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
