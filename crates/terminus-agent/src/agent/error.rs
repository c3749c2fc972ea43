//! Errors that end a run

use thiserror::Error;

use super::state::RunResult;

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("failed to create agent: {0:#}")]
    Bootstrap(anyhow::Error),

    #[error("agent did not respond after {attempts} consecutive attempts")]
    LoopTimeout { attempts: u32 },

    #[error("agent did not complete the task within {max} turns")]
    IterationLimit { max: usize },

    #[error("terminal execution failed: {0:#}")]
    Terminal(anyhow::Error),

    #[error("run cancelled")]
    Cancelled,
}

/// A run that stopped early, with what it gathered before the error
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunFailure {
    pub error: LoopError,
    pub result: Box<RunResult>,
}

impl RunFailure {
    pub fn new(result: RunResult, error: LoopError) -> Self {
        Self {
            error,
            result: Box::new(result),
        }
    }
}
