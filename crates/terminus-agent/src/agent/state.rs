//! Loop state, retry policy and run results

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use terminus_core::config::LoopConfig;
use terminus_core::LettaUsage;

use super::error::LoopError;

/// First prompt of every run
pub const BOOTSTRAP_PROMPT: &str = "Please help me to complete the task. After you send the keys, I will capture the terminal state and send it to you.";

/// Configuration for the command loop
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Maximum agent turns before giving up
    pub max_iterations: usize,
    /// Backoff for failed agent requests
    pub retry: RetryPolicy,
    /// Timeout for keystrokes without an explicit time limit
    pub command_timeout: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from(&LoopConfig::default())
    }
}

impl From<&LoopConfig> for LoopSettings {
    fn from(config: &LoopConfig) -> Self {
        let command_timeout = Some(config.command_timeout_secs)
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or(Duration::from_secs(10));

        Self {
            max_iterations: config.max_iterations,
            retry: RetryPolicy {
                max_retries: config.max_channel_retries,
                base_delay_ms: config.retry_base_delay_ms,
                max_delay_ms: config.retry_max_delay_ms,
                exponential_base: 2.0,
            },
            command_timeout,
        }
    }
}

impl LoopSettings {
    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }
}

/// Exponential backoff for transient agent failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated before the run fails
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }

        let delay = self.base_delay_ms as f64 * self.exponential_base.powi(attempt as i32 - 1);
        let delay = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay)
    }
}

/// Mutable state owned by a single run
#[derive(Debug)]
pub struct LoopState {
    /// What the agent sees next: the bootstrap prompt, then the last rendered terminal
    pub prompt: String,
    pub done: bool,
    pub iteration: usize,
    pub commands_executed: usize,
    /// Consecutive failed agent requests
    pub channel_failures: u32,
    pub usage: TokenUsage,
    pub markers: Vec<TimestampedMarker>,
}

impl LoopState {
    pub fn new() -> Self {
        Self {
            prompt: BOOTSTRAP_PROMPT.to_string(),
            done: false,
            iteration: 0,
            commands_executed: 0,
            channel_failures: 0,
            usage: TokenUsage::default(),
            markers: Vec::new(),
        }
    }

    pub fn increment_iteration(&mut self) {
        self.iteration += 1;
    }

    /// Feed the terminal's output back as the next prompt
    pub fn record_execution(&mut self, rendered_state: String, marker: TimestampedMarker) {
        self.prompt = rendered_state;
        self.commands_executed += 1;
        self.markers.push(marker);
    }

    pub fn mark_done(&mut self) {
        self.done = true;
    }
}

impl Default for LoopState {
    fn default() -> Self {
        Self::new()
    }
}

/// Accumulated token usage across turns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub steps: u64,
}

impl TokenUsage {
    pub fn record(&mut self, usage: &LettaUsage) {
        self.input_tokens += usage.prompt_tokens;
        self.output_tokens += usage.completion_tokens;
        self.steps += usage.step_count;
    }
}

/// A labelled point in the run, seconds since it started
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampedMarker {
    pub timestamp: f64,
    pub label: String,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    None,
    AgentTimeout,
    UnknownAgentError,
    Cancelled,
}

impl From<&LoopError> for FailureMode {
    fn from(err: &LoopError) -> Self {
        match err {
            LoopError::IterationLimit { .. } => FailureMode::AgentTimeout,
            LoopError::Cancelled => FailureMode::Cancelled,
            LoopError::Bootstrap(_) | LoopError::LoopTimeout { .. } | LoopError::Terminal(_) => {
                FailureMode::UnknownAgentError
            }
        }
    }
}

/// Final outcome handed to the result sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub agent_id: Option<String>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub failure_mode: FailureMode,
    pub timestamped_markers: Vec<TimestampedMarker>,
    pub iterations: usize,
    pub commands_executed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    /// Result of a run that reached a completion signal
    pub fn completed(agent_id: &str, state: &LoopState, started_at: DateTime<Utc>) -> Self {
        Self {
            agent_id: Some(agent_id.to_string()),
            total_input_tokens: state.usage.input_tokens,
            total_output_tokens: state.usage.output_tokens,
            failure_mode: FailureMode::None,
            timestamped_markers: state.markers.clone(),
            iterations: state.iteration,
            commands_executed: state.commands_executed,
            error: None,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Result of a loop that stopped with an error after running for a while
    pub fn interrupted(
        agent_id: &str,
        state: &LoopState,
        err: &LoopError,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            failure_mode: FailureMode::from(err),
            error: Some(err.to_string()),
            ..Self::completed(agent_id, state, started_at)
        }
    }

    /// Result of a run that failed before the loop started
    pub fn failed(agent_id: Option<&str>, err: &LoopError, started_at: DateTime<Utc>) -> Self {
        Self {
            agent_id: agent_id.map(str::to_string),
            total_input_tokens: 0,
            total_output_tokens: 0,
            failure_mode: FailureMode::from(err),
            timestamped_markers: Vec::new(),
            iterations: 0,
            commands_executed: 0,
            error: Some(err.to_string()),
            started_at,
            finished_at: Utc::now(),
        }
    }
}
