//! terminus-core: Shared library for Letta-driven terminal agents
//!
//! Provides:
//! - Configuration loading (terminus.toml)
//! - Letta API client and wire types
//! - tmux session management

pub mod config;
pub mod letta;
pub mod tmux;

pub use config::Config;
pub use letta::{
    AgentState, CreateAgentRequest, CreateBlock, EmbeddingConfig, LettaClient, LettaMessage,
    LettaResponse, LettaUsage, LlmConfig, MessageCreate, Role, ToolCall, ToolRecord, ToolRule,
    ToolUpsert,
};
pub use tmux::{TmuxKey, TmuxSession};
