//! Configuration management for terminus.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the configuration file searched for on startup
pub const CONFIG_FILE_NAME: &str = "terminus.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub letta: LettaConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default, rename = "loop")]
    pub control: LoopConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
}

/// Connection to the Letta server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LettaConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer token, only needed for hosted servers
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// LLM settings passed through to the agent's llm_config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model")]
    pub name: String,
    #[serde(default = "default_endpoint_type")]
    pub endpoint_type: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_true")]
    pub enable_reasoner: bool,
    #[serde(default = "default_max_reasoning_tokens")]
    pub max_reasoning_tokens: u32,
    #[serde(default = "default_true")]
    pub put_inner_thoughts_in_kwargs: bool,
    #[serde(default)]
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_endpoint_type")]
    pub endpoint_type: String,
    #[serde(default = "default_embedding_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_embedding_dim")]
    pub dim: u32,
    #[serde(default = "default_embedding_chunk_size")]
    pub chunk_size: u32,
}

/// How the agent is created on the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_type")]
    pub agent_type: String,
    /// File holding the system prompt; the server default is used when unset
    #[serde(default)]
    pub system_prompt_file: Option<PathBuf>,
    /// Tools the agent may call. Must include the terminal tools.
    #[serde(default = "default_tools")]
    pub tools: Vec<String>,
    #[serde(default = "default_block_limit")]
    pub block_limit: u32,
    #[serde(default = "default_todo_description")]
    pub todo_description: String,
}

/// Command loop limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_max_channel_retries")]
    pub max_channel_retries: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// tmux session name; a random one is generated when unset
    #[serde(default)]
    pub session_name: Option<String>,
    #[serde(default = "default_width")]
    pub width: u16,
    #[serde(default = "default_height")]
    pub height: u16,
    /// Pause after non-blocking keystrokes before capturing the pane
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_base_url() -> String {
    "http://localhost:8283".to_string()
}

fn default_request_timeout() -> u64 {
    300
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_endpoint_type() -> String {
    "anthropic".to_string()
}

fn default_endpoint() -> String {
    "https://api.anthropic.com/v1".to_string()
}

fn default_context_window() -> u32 {
    40000
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_max_reasoning_tokens() -> u32 {
    4096
}

fn default_true() -> bool {
    true
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_endpoint_type() -> String {
    "openai".to_string()
}

fn default_embedding_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embedding_dim() -> u32 {
    1536
}

fn default_embedding_chunk_size() -> u32 {
    300
}

fn default_agent_type() -> String {
    "memgpt_v2_agent".to_string()
}

fn default_tools() -> Vec<String> {
    [
        "memory_replace",
        "memory_insert",
        "send_keys",
        "task_completed",
        "quit_process",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_block_limit() -> u32 {
    5000
}

fn default_todo_description() -> String {
    "A list of tasks to complete. You should always make a todo list first, and edit it as you go."
        .to_string()
}

fn default_max_iterations() -> usize {
    200
}

fn default_max_channel_retries() -> u32 {
    5
}

fn default_retry_base_delay() -> u64 {
    500
}

fn default_retry_max_delay() -> u64 {
    30_000
}

fn default_command_timeout() -> f64 {
    10.0
}

fn default_width() -> u16 {
    160
}

fn default_height() -> u16 {
    40
}

fn default_settle_ms() -> u64 {
    1000
}

impl Default for LettaConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model(),
            endpoint_type: default_endpoint_type(),
            endpoint: default_endpoint(),
            context_window: default_context_window(),
            max_tokens: default_max_tokens(),
            enable_reasoner: true,
            max_reasoning_tokens: default_max_reasoning_tokens(),
            put_inner_thoughts_in_kwargs: true,
            temperature: 0.0,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            endpoint_type: default_embedding_endpoint_type(),
            endpoint: default_embedding_endpoint(),
            dim: default_embedding_dim(),
            chunk_size: default_embedding_chunk_size(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_type: default_agent_type(),
            system_prompt_file: None,
            tools: default_tools(),
            block_limit: default_block_limit(),
            todo_description: default_todo_description(),
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_channel_retries: default_max_channel_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            session_name: None,
            width: default_width(),
            height: default_height(),
            settle_ms: default_settle_ms(),
        }
    }
}

impl Config {
    /// Load from an explicit path, or search for terminus.toml and fall back to defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => match Self::find_config_path() {
                Ok(found) => Self::load_from(found),
                Err(_) => Ok(Self::default()),
            },
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.as_ref().display()))
    }

    /// Find terminus.toml by searching current directory and parents
    pub fn find_config_path() -> Result<PathBuf> {
        let mut current = std::env::current_dir()?;

        for _ in 0..10 {
            let candidate = current.join(CONFIG_FILE_NAME);
            if candidate.exists() {
                return Ok(candidate);
            }
            if !current.pop() {
                break;
            }
        }

        anyhow::bail!("{} not found in current directory or parents", CONFIG_FILE_NAME)
    }

    /// Read the configured system prompt, if any
    pub fn system_prompt(&self) -> Result<Option<String>> {
        match self.agent.system_prompt_file {
            Some(ref path) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read system prompt {}", path.display()))
                .map(Some),
            None => Ok(None),
        }
    }

    /// Write a commented default configuration file
    pub fn create_default(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if path.exists() {
            anyhow::bail!("Config file already exists: {}", path.display());
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        std::fs::write(path, DEFAULT_CONFIG)
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}

const DEFAULT_CONFIG: &str = r#"# terminus-agent configuration

[letta]
base_url = "http://localhost:8283"
# token = "..."
request_timeout_secs = 300

[model]
name = "claude-sonnet-4-20250514"
endpoint_type = "anthropic"
endpoint = "https://api.anthropic.com/v1"
context_window = 40000
max_tokens = 8192
enable_reasoner = true
max_reasoning_tokens = 4096
temperature = 0.0

[embedding]
model = "text-embedding-3-small"
endpoint_type = "openai"
endpoint = "https://api.openai.com/v1"
dim = 1536
chunk_size = 300

[agent]
agent_type = "memgpt_v2_agent"
# system_prompt_file = "letta.txt"
tools = ["memory_replace", "memory_insert", "send_keys", "task_completed", "quit_process"]

[loop]
max_iterations = 200
max_channel_retries = 5
retry_base_delay_ms = 500
retry_max_delay_ms = 30000
command_timeout_secs = 10.0

[terminal]
# session_name = "terminus"
width = 160
height = 40
settle_ms = 1000
"#;
