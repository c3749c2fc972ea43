//! terminus-agent: drive a terminal with a Letta agent
//!
//! The agent answers each terminal capture with tool calls; keystrokes are
//! replayed into a tmux session until it calls `task_completed`.

mod agent;
mod bootstrap;
mod channel;
mod commands;
mod sink;
mod terminal;
mod tools;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use terminus_core::Config;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "terminus-agent")]
#[command(about = "Drive a terminal session with a Letta agent", version)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to terminus.toml (searched for in parent directories by default)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Letta server URL (overrides config)
    #[arg(long, global = true, env = "LETTA_BASE_URL")]
    base_url: Option<String>,

    /// Letta API token (overrides config)
    #[arg(long, global = true, env = "LETTA_API_KEY", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a task to completion
    Run {
        /// Task instruction (read from stdin when omitted)
        instruction: Vec<String>,

        /// Read the instruction from a file
        #[arg(short, long)]
        instruction_file: Option<PathBuf>,

        /// Directory for agent.id, agent.af and results.json
        #[arg(short, long, default_value = "logs")]
        logging_dir: PathBuf,

        /// Model to use (overrides config)
        #[arg(short, long, env = "TERMINUS_MODEL")]
        model: Option<String>,

        /// Maximum agent turns
        #[arg(long)]
        max_iterations: Option<usize>,
    },

    /// Check that the Letta server is reachable
    Health,

    /// Export an agent file
    Export {
        /// Agent ID
        agent_id: String,

        /// Output file path
        #[arg(short, long, default_value = "agent.af")]
        output: PathBuf,
    },

    /// Write a default terminus.toml
    InitConfig {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load_or_default(cli.config.as_deref())?;

    if let Some(ref url) = cli.base_url {
        config.letta.base_url = url.clone();
    }
    if let Some(ref token) = cli.token {
        config.letta.token = Some(token.clone());
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Commands::InitConfig { ref output } = cli.command {
        return commands::init_config(output.clone());
    }

    let mut config = load_config(&cli)?;

    match cli.command {
        Commands::Run {
            instruction,
            instruction_file,
            logging_dir,
            model,
            max_iterations,
        } => {
            if let Some(model) = model {
                // Accept provider-prefixed names like anthropic/claude-...
                config.model.name = model.rsplit('/').next().unwrap_or(&model).to_string();
            }
            commands::run(
                config,
                commands::RunOptions {
                    instruction,
                    instruction_file,
                    logging_dir,
                    max_iterations,
                },
            )
            .await
        }
        Commands::Health => commands::health(&config).await,
        Commands::Export { agent_id, output } => {
            commands::export(&config, &agent_id, &output).await
        }
        Commands::InitConfig { .. } => Ok(()),
    }
}
