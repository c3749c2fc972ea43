//! Message channel to the agent service

use async_trait::async_trait;
use terminus_core::{LettaClient, LettaResponse};
use tracing::{debug, warn};

use crate::bootstrap::AgentHandle;

/// Sends one prompt and returns the agent's whole turn.
///
/// `None` means the request failed in a way worth retrying; the loop never
/// treats it as fatal on its own.
#[async_trait]
pub trait AgentChannel: Send + Sync {
    async fn send(&self, agent: &AgentHandle, message: &str) -> Option<LettaResponse>;
}

/// Channel backed by a Letta server
#[derive(Debug, Clone)]
pub struct LettaChannel {
    client: LettaClient,
}

impl LettaChannel {
    pub fn new(client: LettaClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AgentChannel for LettaChannel {
    async fn send(&self, agent: &AgentHandle, message: &str) -> Option<LettaResponse> {
        match self.client.send_message(&agent.id, message.trim()).await {
            Ok(response) => {
                debug!(
                    messages = response.messages.len(),
                    stop_reason = ?response.stop_reason,
                    "Received agent turn"
                );
                Some(response)
            }
            Err(e) => {
                warn!(agent_id = %agent.id, error = %format!("{:#}", e), "Agent request failed");
                None
            }
        }
    }
}
