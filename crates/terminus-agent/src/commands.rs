//! Command implementations

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use terminus_core::config::CONFIG_FILE_NAME;
use terminus_core::{Config, LettaClient};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{CommandLoop, FailureMode, LoopError, LoopSettings, RunResult};
use crate::bootstrap::LettaBootstrap;
use crate::channel::LettaChannel;
use crate::sink::{RecordingBootstrap, RunArtifacts};
use crate::terminal::TmuxExecutor;

/// Overrides collected from the command line
#[derive(Debug, Default)]
pub struct RunOptions {
    pub instruction: Vec<String>,
    pub instruction_file: Option<PathBuf>,
    pub logging_dir: PathBuf,
    pub max_iterations: Option<usize>,
}

/// Resolve the instruction from args, a file, or stdin
fn read_instruction(opts: &RunOptions) -> Result<String> {
    let instruction = if let Some(ref path) = opts.instruction_file {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read instruction from {}", path.display()))?
    } else if !opts.instruction.is_empty() {
        opts.instruction.join(" ")
    } else {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read instruction from stdin")?;
        buf
    };

    let instruction = instruction.trim().to_string();
    if instruction.is_empty() {
        anyhow::bail!("No instruction given");
    }
    Ok(instruction)
}

/// Create an agent and drive it in a fresh tmux session until it finishes
pub async fn run(config: Config, opts: RunOptions) -> Result<()> {
    let instruction = read_instruction(&opts)?;
    let artifacts = RunArtifacts::new(&opts.logging_dir)?;
    info!(dir = %artifacts.dir().display(), "Logging run artifacts");

    let mut settings = LoopSettings::from(&config.control);
    if let Some(max) = opts.max_iterations {
        settings = settings.with_max_iterations(max);
    }

    let client = LettaClient::from_config(&config)?;
    let bootstrap = RecordingBootstrap::new(
        LettaBootstrap::new(client.clone(), config.clone()),
        artifacts.clone(),
    );
    let started_at = Utc::now();

    let terminal = match TmuxExecutor::start(&config.terminal).await {
        Ok(terminal) => terminal,
        Err(e) => {
            let err = LoopError::Terminal(e);
            artifacts.write_result(&RunResult::failed(None, &err, started_at))?;
            return Err(err.into());
        }
    };
    info!(session = %terminal.session_name(), "Attached terminal");

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping after the current step");
            ctrl_c.cancel();
        }
    });

    let mut cmd_loop = CommandLoop::new(LettaChannel::new(client.clone()), terminal, settings)
        .with_cancellation(cancel);
    let outcome = cmd_loop.run(&instruction, &bootstrap).await;
    let (_channel, terminal) = cmd_loop.into_parts();

    if let Err(e) = terminal.shutdown().await {
        warn!(error = %e, "Failed to stop terminal session");
    }

    let (result, error) = match outcome {
        Ok(result) => (result, None),
        Err(failure) => (*failure.result, Some(failure.error)),
    };

    if let Some(ref agent_id) = result.agent_id {
        match client.export_agent(agent_id).await {
            Ok(export) => {
                artifacts.write_agent_file(&export)?;
            }
            Err(e) => warn!(error = %format!("{:#}", e), "Failed to export agent"),
        }
        println!("Agent: {}", agent_id);
    }

    let path = artifacts.write_result(&result)?;
    if result.failure_mode == FailureMode::None {
        println!("Task completed ({})", path.display());
    } else {
        println!("Run failed: {:?} ({})", result.failure_mode, path.display());
    }
    println!(
        "Tokens: {} in / {} out",
        result.total_input_tokens, result.total_output_tokens
    );

    match error {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

/// Check that the Letta server is reachable
pub async fn health(config: &Config) -> Result<()> {
    let client = LettaClient::from_config(config)?;
    if client.health_check().await? {
        println!("Letta server at {} is healthy", client.base_url());
        Ok(())
    } else {
        anyhow::bail!("Letta server at {} is not responding", client.base_url())
    }
}

/// Export an agent file
pub async fn export(config: &Config, agent_id: &str, output: &Path) -> Result<()> {
    let client = LettaClient::from_config(config)?;
    let export = client.export_agent(agent_id).await?;

    let json = serde_json::to_string_pretty(&export)?;
    std::fs::write(output, json)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!("Exported {} to {}", agent_id, output.display());
    Ok(())
}

/// Write a default terminus.toml
pub fn init_config(output: Option<PathBuf>) -> Result<()> {
    let path = output.unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
    Config::create_default(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
