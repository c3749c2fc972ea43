//! Letta API client

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

use crate::config::{Config, EmbeddingConfig as EmbeddingSettings, ModelConfig};

/// Message role accepted by the messages endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageCreate {
    pub role: Role,
    pub content: String,
}

/// A single tool invocation inside a `tool_call_message`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub name: Option<String>,
    /// Normally a JSON-encoded string, but kept raw so structured payloads survive
    #[serde(default)]
    pub arguments: Option<Value>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

impl ToolCall {
    pub fn is_named(&self, name: &str) -> bool {
        self.name.as_deref() == Some(name)
    }
}

/// One event emitted by the agent during a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum LettaMessage {
    ReasoningMessage {
        #[serde(default)]
        reasoning: Option<String>,
    },
    HiddenReasoningMessage {
        #[serde(default)]
        hidden_reasoning: Option<String>,
    },
    ToolCallMessage {
        #[serde(default)]
        tool_call: Option<ToolCall>,
        /// Parallel calls, sent by newer servers instead of `tool_call`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<ToolCall>>,
    },
    ToolReturnMessage {
        #[serde(default)]
        tool_return: Value,
        #[serde(default)]
        status: Option<String>,
    },
    AssistantMessage {
        #[serde(default)]
        content: Value,
    },
    UserMessage {
        #[serde(default)]
        content: Value,
    },
    SystemMessage {
        #[serde(default)]
        content: Value,
    },
    #[serde(other)]
    Other,
}

impl LettaMessage {
    /// Tool calls carried by this event, in the order they were made
    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        match self {
            LettaMessage::ToolCallMessage {
                tool_call,
                tool_calls,
            } => tool_call
                .iter()
                .chain(tool_calls.iter().flatten())
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Decode each event on its own so one odd event cannot sink the whole turn
fn lenient_messages<'de, D>(deserializer: D) -> std::result::Result<Vec<LettaMessage>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();

    Ok(raw
        .into_iter()
        .map(|value| {
            let message_type = value
                .get("message_type")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            serde_json::from_value(value).unwrap_or_else(|e| {
                warn!(%message_type, error = %e, "Skipping undecodable agent event");
                LettaMessage::Other
            })
        })
        .collect())
}

/// Token usage reported for one request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LettaUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub step_count: u64,
}

/// Response from the messages endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LettaResponse {
    #[serde(default, deserialize_with = "lenient_messages")]
    pub messages: Vec<LettaMessage>,
    #[serde(default)]
    pub usage: Option<LettaUsage>,
    #[serde(default)]
    pub stop_reason: Option<Value>,
}

/// Agent record returned on creation
#[derive(Debug, Clone, Deserialize)]
pub struct AgentState {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tools: Vec<ToolRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolRecord {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateBlock {
    pub label: String,
    pub value: String,
    pub limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub read_only: bool,
}

/// Tool rule; `exit_loop` ends the agent step once the tool runs
#[derive(Debug, Clone, Serialize)]
pub struct ToolRule {
    pub tool_name: String,
    #[serde(rename = "type")]
    pub rule_type: String,
}

impl ToolRule {
    pub fn terminal(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            rule_type: "exit_loop".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LlmConfig {
    pub model: String,
    pub model_endpoint_type: String,
    pub model_endpoint: String,
    pub model_wrapper: Option<String>,
    pub context_window: u32,
    pub put_inner_thoughts_in_kwargs: bool,
    pub enable_reasoner: bool,
    pub max_reasoning_tokens: u32,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl From<&ModelConfig> for LlmConfig {
    fn from(model: &ModelConfig) -> Self {
        Self {
            model: model.name.clone(),
            model_endpoint_type: model.endpoint_type.clone(),
            model_endpoint: model.endpoint.clone(),
            model_wrapper: None,
            context_window: model.context_window,
            put_inner_thoughts_in_kwargs: model.put_inner_thoughts_in_kwargs,
            enable_reasoner: model.enable_reasoner,
            max_reasoning_tokens: model.max_reasoning_tokens,
            max_tokens: model.max_tokens,
            temperature: model.temperature,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingConfig {
    pub embedding_model: String,
    pub embedding_endpoint_type: String,
    pub embedding_endpoint: String,
    pub embedding_dim: u32,
    pub embedding_chunk_size: u32,
}

impl From<&EmbeddingSettings> for EmbeddingConfig {
    fn from(embedding: &EmbeddingSettings) -> Self {
        Self {
            embedding_model: embedding.model.clone(),
            embedding_endpoint_type: embedding.endpoint_type.clone(),
            embedding_endpoint: embedding.endpoint.clone(),
            embedding_dim: embedding.dim,
            embedding_chunk_size: embedding.chunk_size,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateAgentRequest {
    pub agent_type: String,
    pub memory_blocks: Vec<CreateBlock>,
    pub tools: Vec<String>,
    pub tool_rules: Vec<ToolRule>,
    pub llm_config: LlmConfig,
    pub embedding_config: EmbeddingConfig,
    pub initial_message_sequence: Vec<MessageCreate>,
    pub include_base_tools: bool,
    pub include_base_tool_rules: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

/// Body for creating or replacing a custom tool
#[derive(Debug, Clone, Serialize)]
pub struct ToolUpsert {
    pub source_code: String,
    pub json_schema: Value,
    pub description: String,
}

/// Letta API client
#[derive(Debug, Clone)]
pub struct LettaClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl LettaClient {
    /// Create a new client with the given request timeout
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.letta.base_url.clone(),
            config.letta.token.clone(),
            Duration::from_secs(config.letta.request_timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match self.token {
            Some(ref token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Check if the server is reachable
    pub async fn health_check(&self) -> Result<bool> {
        match self
            .request(reqwest::Method::GET, "/v1/health/")
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    /// Create or replace a custom tool
    pub async fn upsert_tool(&self, tool: &ToolUpsert) -> Result<ToolRecord> {
        self.request(reqwest::Method::PUT, "/v1/tools/")
            .json(tool)
            .send()
            .await
            .context("Failed to connect to Letta")?
            .error_for_status()
            .context("Tool upsert failed")?
            .json()
            .await
            .context("Failed to parse tool response")
    }

    /// Create an agent
    pub async fn create_agent(&self, req: &CreateAgentRequest) -> Result<AgentState> {
        self.request(reqwest::Method::POST, "/v1/agents/")
            .json(req)
            .send()
            .await
            .context("Failed to connect to Letta")?
            .error_for_status()
            .context("Agent creation failed")?
            .json()
            .await
            .context("Failed to parse agent response")
    }

    /// Send a user message and wait for the agent's full turn
    pub async fn send_message(&self, agent_id: &str, content: &str) -> Result<LettaResponse> {
        #[derive(Serialize)]
        struct SendRequest<'a> {
            messages: &'a [MessageCreate],
        }

        let messages = [MessageCreate {
            role: Role::User,
            content: content.to_string(),
        }];

        self.request(
            reqwest::Method::POST,
            &format!("/v1/agents/{}/messages", agent_id),
        )
        .json(&SendRequest {
            messages: &messages,
        })
        .send()
        .await
        .context("Failed to send message")?
        .error_for_status()
        .context("Message request failed")?
        .json()
        .await
        .context("Failed to parse message response")
    }

    /// Export the full agent file
    pub async fn export_agent(&self, agent_id: &str) -> Result<Value> {
        self.request(
            reqwest::Method::GET,
            &format!("/v1/agents/{}/export", agent_id),
        )
        .send()
        .await
        .context("Failed to connect to Letta")?
        .error_for_status()
        .context("Agent export failed")?
        .json()
        .await
        .context("Failed to parse agent export")
    }
}
