//! Run artifacts written to the logging directory

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::agent::RunResult;
use crate::bootstrap::{AgentHandle, SessionBootstrap};

pub const AGENT_ID_FILE: &str = "agent.id";
pub const AGENT_FILE: &str = "agent.af";
pub const RESULTS_FILE: &str = "results.json";

/// Writes `agent.id`, `agent.af` and `results.json`
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    dir: PathBuf,
}

impl RunArtifacts {
    /// Use `dir`, creating it if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create logging directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_agent_id(&self, agent: &AgentHandle) -> Result<PathBuf> {
        let path = self.dir.join(AGENT_ID_FILE);
        fs::write(&path, &agent.id).context("Failed to write agent id")?;
        Ok(path)
    }

    /// Pretty-print an exported agent file
    pub fn write_agent_file(&self, export: &Value) -> Result<PathBuf> {
        let path = self.dir.join(AGENT_FILE);
        let json = serde_json::to_string_pretty(export).context("Failed to serialize agent file")?;
        fs::write(&path, json).context("Failed to write agent file")?;
        Ok(path)
    }

    pub fn write_result(&self, result: &RunResult) -> Result<PathBuf> {
        let path = self.dir.join(RESULTS_FILE);
        let json = serde_json::to_string_pretty(result).context("Failed to serialize run result")?;
        fs::write(&path, json).context("Failed to write run result")?;

        info!(path = %path.display(), failure_mode = ?result.failure_mode, "Saved run result");
        Ok(path)
    }
}

/// Records `agent.id` as soon as the wrapped bootstrap has created the agent
pub struct RecordingBootstrap<B> {
    inner: B,
    artifacts: RunArtifacts,
}

impl<B> RecordingBootstrap<B> {
    pub fn new(inner: B, artifacts: RunArtifacts) -> Self {
        Self { inner, artifacts }
    }
}

#[async_trait]
impl<B: SessionBootstrap> SessionBootstrap for RecordingBootstrap<B> {
    async fn create_agent(&self, instruction: &str) -> Result<AgentHandle> {
        let agent = self.inner.create_agent(instruction).await?;
        let path = self.artifacts.write_agent_id(&agent)?;
        info!(agent_id = %agent.id, path = %path.display(), "Recorded agent id");
        Ok(agent)
    }
}
