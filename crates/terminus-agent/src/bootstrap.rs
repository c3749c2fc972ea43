//! Agent creation

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use terminus_core::{
    Config, CreateAgentRequest, CreateBlock, EmbeddingConfig, LettaClient, LlmConfig, ToolRule,
};
use tracing::{debug, info};

use crate::agent::{QUIT_PROCESS, SEND_KEYS, TERMINAL_TOOLS};
use crate::tools::terminal_tools;

/// An agent created on the service; the loop only passes it through
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentHandle {
    pub id: String,
    pub name: String,
    pub model: String,
    pub tools: Vec<String>,
}

#[async_trait]
pub trait SessionBootstrap: Send + Sync {
    /// Create an agent whose read-only context is `instruction`
    async fn create_agent(&self, instruction: &str) -> Result<AgentHandle>;
}

/// Creates agents on a Letta server
pub struct LettaBootstrap {
    client: LettaClient,
    config: Config,
}

impl LettaBootstrap {
    pub fn new(client: LettaClient, config: Config) -> Self {
        Self { client, config }
    }

    /// Every tool the parser acts on must be callable by the agent
    pub fn validate_tools(tools: &[String]) -> Result<()> {
        let missing: Vec<&str> = TERMINAL_TOOLS
            .iter()
            .copied()
            .filter(|name| !tools.iter().any(|t| t == name))
            .collect();

        if !missing.is_empty() {
            anyhow::bail!(
                "Agent tool list is missing terminal tools: {}",
                missing.join(", ")
            );
        }
        Ok(())
    }

    fn memory_blocks(&self, instruction: &str) -> Vec<CreateBlock> {
        vec![
            CreateBlock {
                label: "task description".to_string(),
                value: instruction.to_string(),
                limit: self.config.agent.block_limit,
                description: None,
                read_only: true,
            },
            CreateBlock {
                label: "todo list".to_string(),
                value: String::new(),
                limit: self.config.agent.block_limit,
                description: Some(self.config.agent.todo_description.clone()),
                read_only: false,
            },
        ]
    }

    /// Build the creation request without touching the network
    pub fn build_request(
        &self,
        instruction: &str,
        system: Option<String>,
    ) -> Result<CreateAgentRequest> {
        Self::validate_tools(&self.config.agent.tools)?;

        Ok(CreateAgentRequest {
            agent_type: self.config.agent.agent_type.clone(),
            memory_blocks: self.memory_blocks(instruction),
            tools: self.config.agent.tools.clone(),
            tool_rules: vec![ToolRule::terminal(SEND_KEYS), ToolRule::terminal(QUIT_PROCESS)],
            llm_config: LlmConfig::from(&self.config.model),
            embedding_config: EmbeddingConfig::from(&self.config.embedding),
            initial_message_sequence: Vec::new(),
            include_base_tools: false,
            include_base_tool_rules: false,
            system,
        })
    }
}

#[async_trait]
impl SessionBootstrap for LettaBootstrap {
    async fn create_agent(&self, instruction: &str) -> Result<AgentHandle> {
        let system = self.config.system_prompt()?;
        let request = self.build_request(instruction, system)?;

        for tool in terminal_tools() {
            let upsert = tool
                .to_upsert()
                .with_context(|| format!("Failed to build schema for {}", tool.name))?;
            let record = self
                .client
                .upsert_tool(&upsert)
                .await
                .with_context(|| format!("Failed to register tool {}", tool.name))?;
            debug!(tool = %record.name, id = ?record.id, "Registered tool");
        }

        let state = self.client.create_agent(&request).await?;
        info!(agent_id = %state.id, model = %request.llm_config.model, "Created agent");

        Ok(AgentHandle {
            id: state.id,
            name: state.name,
            model: request.llm_config.model,
            tools: request.tools,
        })
    }
}
