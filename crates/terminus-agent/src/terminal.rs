//! Terminal execution backends

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use terminus_core::config::TerminalConfig;
use terminus_core::tmux::{split_keys, TmuxKey, TmuxSession};
use tracing::debug;

use crate::agent::Command;

/// What the terminal looked like after a batch of commands
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutcome {
    pub timed_out: bool,
    pub rendered_state: String,
}

#[async_trait]
pub trait TerminalExecutor: Send {
    /// Run the commands in order and capture the terminal afterwards
    async fn execute(&mut self, commands: &[Command]) -> Result<ExecOutcome>;
}

/// Executor backed by a detached tmux session
#[derive(Debug)]
pub struct TmuxExecutor {
    session: TmuxSession,
    settle: Duration,
    previous_history: Option<String>,
    waits: u64,
}

impl TmuxExecutor {
    /// Start a new tmux session
    pub async fn start(config: &TerminalConfig) -> Result<Self> {
        let mut session = TmuxSession::new(config);
        session.start().await?;

        Ok(Self {
            session,
            settle: Duration::from_millis(config.settle_ms),
            previous_history: None,
            waits: 0,
        })
    }

    pub fn session_name(&self) -> &str {
        self.session.name()
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.session.stop().await
    }

    async fn run_command(&mut self, command: &Command) -> Result<bool> {
        let mut keys = split_keys(&command.keystrokes);

        if !command.blocking {
            self.session.send_keys(&keys).await?;
            tokio::time::sleep(self.settle.min(command.timeout)).await;
            return Ok(false);
        }

        self.waits += 1;
        let channel = format!("{}-done-{}", self.session.name(), self.waits);
        add_wait_signal(&mut keys, &channel);

        self.session.send_keys(&keys).await?;
        let finished = self.session.wait_for(&channel, command.timeout).await?;
        Ok(!finished)
    }

    async fn render(&mut self) -> Result<String> {
        let history = self.session.capture_history().await?;
        let screen = self.session.capture_screen().await?;
        let rendered = incremental_output(self.previous_history.as_deref(), &history, &screen);
        self.previous_history = Some(history);
        Ok(rendered)
    }
}

#[async_trait]
impl TerminalExecutor for TmuxExecutor {
    async fn execute(&mut self, commands: &[Command]) -> Result<ExecOutcome> {
        let mut timed_out = false;

        for command in commands {
            debug!(
                session = %self.session.name(),
                keys = %command.keystrokes.escape_debug(),
                blocking = command.blocking,
                "Sending keys"
            );
            if self.run_command(command).await? {
                timed_out = true;
                break;
            }
        }

        Ok(ExecOutcome {
            timed_out,
            rendered_state: self.render().await?,
        })
    }
}

/// Make a blocking command signal `channel` when the shell finishes it
fn add_wait_signal(keys: &mut Vec<TmuxKey>, channel: &str) {
    let signal = TmuxKey::Literal(format!("; tmux wait -S {}", channel));
    let ends_with_enter = matches!(keys.last(), Some(TmuxKey::Named(name)) if name == "Enter");

    if ends_with_enter {
        let last = keys.len() - 1;
        keys.insert(last, signal);
    } else {
        keys.push(signal);
        keys.push(TmuxKey::Named("Enter".to_string()));
    }
}

/// Only the new part of the scrollback if it extends the last capture,
/// otherwise the whole visible screen
pub fn incremental_output(previous: Option<&str>, history: &str, screen: &str) -> String {
    if let Some(previous) = previous {
        let history = history.trim_end();
        if let Some(new) = history.strip_prefix(previous.trim_end()) {
            let new = new.trim_start_matches('\n');
            if !new.trim().is_empty() {
                return format!("New Terminal Output:\n{}", new);
            }
        }
    }

    format!("Current Terminal Screen:\n{}", screen.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_capture_shows_screen() {
        let out = incremental_output(None, "$ ls\na b\n$\n\n", "$ ls\na b\n$\n\n\n");
        assert_eq!(out, "Current Terminal Screen:\n$ ls\na b\n$");
    }

    #[test]
    fn test_extended_history_shows_new_output() {
        let out = incremental_output(Some("$ ls\na b\n$\n"), "$ ls\na b\n$ pwd\n/root\n$\n", "irrelevant");
        assert_eq!(out, "New Terminal Output:\n pwd\n/root\n$");
    }

    #[test]
    fn test_unchanged_history_shows_screen() {
        let out = incremental_output(Some("$ top"), "$ top\n\n", "top - 10:00:00");
        assert_eq!(out, "Current Terminal Screen:\ntop - 10:00:00");
    }

    #[test]
    fn test_rewritten_history_shows_screen() {
        let out = incremental_output(Some("$ vim notes.txt"), "~\n~\n\"notes.txt\" 0L", "~\n~");
        assert_eq!(out, "Current Terminal Screen:\n~\n~");
    }

    #[test]
    fn test_wait_signal_goes_before_enter() {
        let mut keys = split_keys("make test\n");
        add_wait_signal(&mut keys, "s-done-1");

        assert_eq!(
            keys,
            vec![
                TmuxKey::Literal("make test".to_string()),
                TmuxKey::Literal("; tmux wait -S s-done-1".to_string()),
                TmuxKey::Named("Enter".to_string()),
            ]
        );
    }

    #[test]
    fn test_wait_signal_appends_enter() {
        let mut keys = split_keys("make");
        add_wait_signal(&mut keys, "c");

        assert_eq!(keys.len(), 3);
        assert_eq!(keys[2], TmuxKey::Named("Enter".to_string()));
    }
}
