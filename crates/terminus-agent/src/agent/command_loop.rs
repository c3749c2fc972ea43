//! Command loop implementation
//!
//! One turn at a time: send the current prompt, parse the reply, run the
//! command in the terminal and use what the terminal shows as the next
//! prompt. A command sent in the same turn as `task_completed` is executed
//! before the loop stops. A turn with neither a command nor a completion
//! signal re-sends the unchanged prompt.

use std::time::Instant;

use chrono::Utc;
use terminus_core::LettaResponse;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::bootstrap::{AgentHandle, SessionBootstrap};
use crate::channel::AgentChannel;
use crate::terminal::TerminalExecutor;

use super::error::{LoopError, RunFailure};
use super::parser::ResponseParser;
use super::state::{LoopSettings, LoopState, RunResult, TimestampedMarker};

/// Drives an agent and a terminal until the agent reports completion
pub struct CommandLoop<C, T> {
    channel: C,
    terminal: T,
    parser: ResponseParser,
    settings: LoopSettings,
    cancel: CancellationToken,
}

impl<C: AgentChannel, T: TerminalExecutor> CommandLoop<C, T> {
    pub fn new(channel: C, terminal: T, settings: LoopSettings) -> Self {
        Self {
            channel,
            terminal,
            parser: ResponseParser::new(settings.command_timeout),
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop the loop from outside; takes effect between steps
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Hand the collaborators back so the caller can close them
    pub fn into_parts(self) -> (C, T) {
        (self.channel, self.terminal)
    }

    /// Create the agent for `instruction` and run it to completion
    pub async fn run(
        &mut self,
        instruction: &str,
        bootstrap: &dyn SessionBootstrap,
    ) -> Result<RunResult, RunFailure> {
        let started_at = Utc::now();
        let agent = match bootstrap.create_agent(instruction).await {
            Ok(agent) => agent,
            Err(e) => {
                let error = LoopError::Bootstrap(e);
                return Err(RunFailure::new(
                    RunResult::failed(None, &error, started_at),
                    error,
                ));
            }
        };

        self.run_with_agent(&agent).await
    }

    /// Run an already created agent to completion
    ///
    /// On failure the returned [`RunFailure`] still carries the tokens,
    /// markers and counters gathered before the loop stopped.
    #[instrument(skip(self, agent), fields(agent_id = %agent.id, model = %agent.model))]
    pub async fn run_with_agent(&mut self, agent: &AgentHandle) -> Result<RunResult, RunFailure> {
        info!(
            max_iterations = self.settings.max_iterations,
            "Starting command loop"
        );
        let started_at = Utc::now();
        let mut state = LoopState::new();

        match self.drive(agent, &mut state).await {
            Ok(()) => {
                info!(
                    iterations = state.iteration,
                    commands = state.commands_executed,
                    input_tokens = state.usage.input_tokens,
                    output_tokens = state.usage.output_tokens,
                    "Agent completed task"
                );
                Ok(RunResult::completed(&agent.id, &state, started_at))
            }
            Err(error) => {
                warn!(
                    iterations = state.iteration,
                    commands = state.commands_executed,
                    error = %error,
                    "Command loop stopped"
                );
                Err(RunFailure::new(
                    RunResult::interrupted(&agent.id, &state, &error, started_at),
                    error,
                ))
            }
        }
    }

    async fn drive(&mut self, agent: &AgentHandle, state: &mut LoopState) -> Result<(), LoopError> {
        let clock = Instant::now();

        while !state.done {
            self.check_cancelled()?;

            if state.iteration >= self.settings.max_iterations {
                warn!(
                    max_iterations = self.settings.max_iterations,
                    "Agent reached maximum iterations"
                );
                return Err(LoopError::IterationLimit {
                    max: self.settings.max_iterations,
                });
            }

            state.increment_iteration();
            debug!(iteration = state.iteration, prompt_len = state.prompt.len(), "Starting iteration");

            let response = self.await_response(agent, state).await?;
            if let Some(ref usage) = response.usage {
                state.usage.record(usage);
            }

            let turn = self.parser.parse(&response.messages);
            if let Some(ref e) = turn.malformed {
                warn!(error = %e, "Ignoring malformed tool call");
            }

            match turn.command {
                Some(command) => {
                    debug!(
                        keys = %command.keystrokes.escape_debug(),
                        abort = turn.abort,
                        "Executing command"
                    );
                    let outcome = self
                        .terminal
                        .execute(std::slice::from_ref(&command))
                        .await
                        .map_err(LoopError::Terminal)?;

                    if outcome.timed_out {
                        warn!(
                            timeout_secs = command.timeout.as_secs_f64(),
                            "Command timed out; continuing with captured state"
                        );
                    }

                    let marker = TimestampedMarker {
                        timestamp: clock.elapsed().as_secs_f64(),
                        label: format!(
                            "Episode {}: {}",
                            state.iteration,
                            command.keystrokes.trim_end()
                        ),
                    };
                    state.record_execution(outcome.rendered_state, marker);
                }
                None if !turn.is_actionable() => {
                    debug!(iteration = state.iteration, "Turn had no command; re-prompting");
                }
                None => {}
            }

            if turn.completed {
                state.mark_done();
            }
        }

        Ok(())
    }

    /// Send the current prompt, retrying transient failures with backoff
    async fn await_response(
        &self,
        agent: &AgentHandle,
        state: &mut LoopState,
    ) -> Result<LettaResponse, LoopError> {
        loop {
            let sent = tokio::select! {
                _ = self.cancel.cancelled() => return Err(LoopError::Cancelled),
                sent = self.channel.send(agent, &state.prompt) => sent,
            };

            if let Some(response) = sent {
                state.channel_failures = 0;
                return Ok(response);
            }

            state.channel_failures += 1;
            if state.channel_failures > self.settings.retry.max_retries {
                warn!(attempts = state.channel_failures, "Giving up on agent");
                return Err(LoopError::LoopTimeout {
                    attempts: state.channel_failures,
                });
            }

            let delay = self.settings.retry.delay_for_attempt(state.channel_failures);
            warn!(
                attempt = state.channel_failures,
                delay = ?delay,
                "No response from agent; retrying"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(LoopError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn check_cancelled(&self) -> Result<(), LoopError> {
        if self.cancel.is_cancelled() {
            info!("Command loop cancelled");
            return Err(LoopError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::command::Command;
    use crate::agent::parser::{QUIT_PROCESS, SEND_KEYS, TASK_COMPLETED};
    use crate::agent::state::{FailureMode, RetryPolicy, BOOTSTRAP_PROMPT};
    use crate::terminal::ExecOutcome;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use terminus_core::{LettaMessage, LettaUsage, ToolCall};

    /// Replays canned responses; `None` entries simulate transport failures
    struct ScriptedChannel {
        responses: Mutex<VecDeque<Option<LettaResponse>>>,
        prompts: Mutex<Vec<String>>,
        fallback: Option<LettaResponse>,
    }

    impl ScriptedChannel {
        fn new(responses: Vec<Option<LettaResponse>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                prompts: Mutex::new(Vec::new()),
                fallback: None,
            }
        }

        fn repeating(response: LettaResponse) -> Self {
            Self {
                fallback: Some(response),
                ..Self::new(vec![])
            }
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentChannel for ScriptedChannel {
        async fn send(&self, _agent: &AgentHandle, message: &str) -> Option<LettaResponse> {
            self.prompts.lock().unwrap().push(message.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone())
        }
    }

    #[derive(Default)]
    struct RecordingTerminal {
        outcomes: VecDeque<ExecOutcome>,
        executed: Vec<Command>,
    }

    impl RecordingTerminal {
        fn with_outcomes(outcomes: Vec<ExecOutcome>) -> Self {
            Self {
                outcomes: outcomes.into(),
                executed: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl TerminalExecutor for RecordingTerminal {
        async fn execute(&mut self, commands: &[Command]) -> Result<ExecOutcome> {
            self.executed.extend_from_slice(commands);
            Ok(self.outcomes.pop_front().unwrap_or_else(|| ExecOutcome {
                timed_out: false,
                rendered_state: format!("screen {}", self.executed.len()),
            }))
        }
    }

    struct FailingTerminal;

    #[async_trait]
    impl TerminalExecutor for FailingTerminal {
        async fn execute(&mut self, _commands: &[Command]) -> Result<ExecOutcome> {
            anyhow::bail!("tmux session is gone")
        }
    }

    struct StubBootstrap {
        fail: bool,
    }

    #[async_trait]
    impl SessionBootstrap for StubBootstrap {
        async fn create_agent(&self, _instruction: &str) -> Result<AgentHandle> {
            if self.fail {
                anyhow::bail!("server unavailable");
            }
            Ok(agent())
        }
    }

    fn agent() -> AgentHandle {
        AgentHandle {
            id: "agent-123".to_string(),
            name: "terminus".to_string(),
            model: "test-model".to_string(),
            tools: vec![],
        }
    }

    fn tool(name: &str, args: serde_json::Value) -> LettaMessage {
        LettaMessage::ToolCallMessage {
            tool_call: Some(ToolCall {
                name: Some(name.to_string()),
                arguments: Some(serde_json::Value::String(args.to_string())),
                tool_call_id: None,
            }),
            tool_calls: None,
        }
    }

    fn turn(messages: Vec<LettaMessage>) -> Option<LettaResponse> {
        Some(LettaResponse {
            messages,
            usage: None,
            stop_reason: None,
        })
    }

    fn keys(k: &str) -> LettaMessage {
        tool(SEND_KEYS, json!({ "keys": k }))
    }

    fn completed() -> LettaMessage {
        tool(TASK_COMPLETED, json!({}))
    }

    fn settings() -> LoopSettings {
        LoopSettings {
            max_iterations: 20,
            retry: RetryPolicy {
                max_retries: 3,
                base_delay_ms: 0,
                max_delay_ms: 0,
                exponential_base: 2.0,
            },
            command_timeout: std::time::Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn test_retries_absent_responses_then_completes() {
        let channel = ScriptedChannel::new(vec![None, None, turn(vec![completed()])]);
        let mut cmd_loop = CommandLoop::new(channel, RecordingTerminal::default(), settings());

        let result = cmd_loop.run_with_agent(&agent()).await.unwrap();
        let (channel, terminal) = cmd_loop.into_parts();

        assert_eq!(channel.prompts().len(), 3);
        assert!(channel.prompts().iter().all(|p| p == BOOTSTRAP_PROMPT));
        assert!(terminal.executed.is_empty());
        assert_eq!(result.failure_mode, FailureMode::None);
        assert_eq!(result.iterations, 1);
    }

    #[tokio::test]
    async fn test_rendered_state_becomes_next_prompt() {
        let channel = ScriptedChannel::new(vec![
            turn(vec![keys("ls")]),
            turn(vec![keys("cat README.md")]),
            turn(vec![completed()]),
        ]);
        let mut cmd_loop = CommandLoop::new(channel, RecordingTerminal::default(), settings());

        let result = cmd_loop.run_with_agent(&agent()).await.unwrap();
        let (channel, terminal) = cmd_loop.into_parts();

        assert_eq!(
            channel.prompts(),
            vec![BOOTSTRAP_PROMPT.to_string(), "screen 1".to_string(), "screen 2".to_string()]
        );
        assert_eq!(terminal.executed[0].keystrokes, "ls\n");
        assert_eq!(terminal.executed[1].keystrokes, "cat README.md\n");
        assert_eq!(result.commands_executed, 2);
        assert_eq!(result.timestamped_markers.len(), 2);
        assert!(result.timestamped_markers[0].label.ends_with("ls"));
    }

    #[tokio::test]
    async fn test_timeout_does_not_stop_the_run() {
        let channel = ScriptedChannel::new(vec![
            turn(vec![keys("sleep 600")]),
            turn(vec![tool(QUIT_PROCESS, json!({}))]),
            turn(vec![completed()]),
        ]);
        let terminal = RecordingTerminal::with_outcomes(vec![ExecOutcome {
            timed_out: true,
            rendered_state: "$ sleep 600".to_string(),
        }]);
        let mut cmd_loop = CommandLoop::new(channel, terminal, settings());

        let result = cmd_loop.run_with_agent(&agent()).await.unwrap();
        let (channel, terminal) = cmd_loop.into_parts();

        assert_eq!(channel.prompts()[1], "$ sleep 600");
        assert_eq!(terminal.executed.len(), 2);
        assert_eq!(result.failure_mode, FailureMode::None);
    }

    #[tokio::test]
    async fn test_abort_sends_interrupt_and_continues() {
        let channel = ScriptedChannel::new(vec![
            turn(vec![keys("vim"), tool(QUIT_PROCESS, json!({}))]),
            turn(vec![completed()]),
        ]);
        let mut cmd_loop = CommandLoop::new(channel, RecordingTerminal::default(), settings());

        cmd_loop.run_with_agent(&agent()).await.unwrap();
        let (channel, terminal) = cmd_loop.into_parts();

        assert_eq!(channel.prompts().len(), 2);
        assert_eq!(terminal.executed.len(), 1);
        assert_eq!(terminal.executed[0].keystrokes, "C-c");
    }

    #[tokio::test]
    async fn test_command_runs_before_completion() {
        let channel = ScriptedChannel::new(vec![turn(vec![keys("echo done"), completed()])]);
        let mut cmd_loop = CommandLoop::new(channel, RecordingTerminal::default(), settings());

        let result = cmd_loop.run_with_agent(&agent()).await.unwrap();
        let (channel, terminal) = cmd_loop.into_parts();

        assert_eq!(channel.prompts().len(), 1);
        assert_eq!(terminal.executed.len(), 1);
        assert_eq!(result.commands_executed, 1);
    }

    #[tokio::test]
    async fn test_empty_turn_reprompts_unchanged() {
        let channel = ScriptedChannel::new(vec![
            turn(vec![keys("ls")]),
            turn(vec![LettaMessage::ReasoningMessage {
                reasoning: Some("hmm".to_string()),
            }]),
            turn(vec![completed()]),
        ]);
        let mut cmd_loop = CommandLoop::new(channel, RecordingTerminal::default(), settings());

        let result = cmd_loop.run_with_agent(&agent()).await.unwrap();
        let (channel, _) = cmd_loop.into_parts();

        assert_eq!(channel.prompts()[1], "screen 1");
        assert_eq!(channel.prompts()[2], "screen 1");
        assert_eq!(result.iterations, 3);
    }

    #[tokio::test]
    async fn test_malformed_arguments_execute_nothing() {
        let malformed = LettaMessage::ToolCallMessage {
            tool_call: Some(ToolCall {
                name: Some(SEND_KEYS.to_string()),
                arguments: Some(json!("{broken")),
                tool_call_id: None,
            }),
            tool_calls: None,
        };
        let channel = ScriptedChannel::new(vec![turn(vec![malformed, completed()])]);
        let mut cmd_loop = CommandLoop::new(channel, RecordingTerminal::default(), settings());

        let result = cmd_loop.run_with_agent(&agent()).await.unwrap();
        let (_, terminal) = cmd_loop.into_parts();

        assert!(terminal.executed.is_empty());
        assert_eq!(result.failure_mode, FailureMode::None);
    }

    #[tokio::test]
    async fn test_retry_limit_fails_run() {
        let channel = ScriptedChannel::new(vec![]);
        let mut cmd_loop = CommandLoop::new(channel, RecordingTerminal::default(), settings());

        let err = cmd_loop.run_with_agent(&agent()).await.unwrap_err();
        let (channel, _) = cmd_loop.into_parts();

        assert!(matches!(err.error, LoopError::LoopTimeout { attempts: 4 }));
        assert_eq!(channel.prompts().len(), 4);
    }

    #[tokio::test]
    async fn test_retry_counter_resets_after_success() {
        let channel = ScriptedChannel::new(vec![
            None,
            None,
            None,
            turn(vec![keys("ls")]),
            None,
            None,
            None,
            turn(vec![completed()]),
        ]);
        let mut cmd_loop = CommandLoop::new(channel, RecordingTerminal::default(), settings());

        let result = cmd_loop.run_with_agent(&agent()).await.unwrap();
        assert_eq!(result.iterations, 2);
    }

    #[tokio::test]
    async fn test_iteration_limit() {
        let channel = ScriptedChannel::repeating(LettaResponse::default());
        let mut cmd_loop = CommandLoop::new(
            channel,
            RecordingTerminal::default(),
            settings().with_max_iterations(3),
        );

        let err = cmd_loop.run_with_agent(&agent()).await.unwrap_err();
        let (channel, _) = cmd_loop.into_parts();

        assert!(matches!(err.error, LoopError::IterationLimit { max: 3 }));
        assert_eq!(channel.prompts().len(), 3);
        assert_eq!(err.result.failure_mode, FailureMode::AgentTimeout);
        assert_eq!(err.result.iterations, 3);
    }

    #[tokio::test]
    async fn test_iteration_limit_keeps_progress() {
        let usage = LettaUsage {
            prompt_tokens: 200,
            completion_tokens: 10,
            total_tokens: 210,
            step_count: 1,
        };
        let channel = ScriptedChannel::repeating(LettaResponse {
            messages: vec![keys("make")],
            usage: Some(usage),
            stop_reason: None,
        });
        let mut cmd_loop = CommandLoop::new(
            channel,
            RecordingTerminal::default(),
            settings().with_max_iterations(2),
        );

        let err = cmd_loop.run_with_agent(&agent()).await.unwrap_err();
        let result = err.result;

        assert_eq!(result.agent_id.as_deref(), Some("agent-123"));
        assert_eq!(result.total_input_tokens, 400);
        assert_eq!(result.total_output_tokens, 20);
        assert_eq!(result.commands_executed, 2);
        assert_eq!(result.timestamped_markers.len(), 2);
        assert!(result.error.as_deref().unwrap().contains("2 turns"));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_turn() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let channel = ScriptedChannel::new(vec![turn(vec![completed()])]);
        let mut cmd_loop = CommandLoop::new(channel, RecordingTerminal::default(), settings())
            .with_cancellation(cancel);

        let err = cmd_loop.run_with_agent(&agent()).await.unwrap_err();
        let (channel, _) = cmd_loop.into_parts();

        assert!(matches!(err.error, LoopError::Cancelled));
        assert!(channel.prompts().is_empty());
    }

    /// Never answers, so the loop stays parked in the agent request
    struct SilentChannel;

    #[async_trait]
    impl AgentChannel for SilentChannel {
        async fn send(&self, _agent: &AgentHandle, _message: &str) -> Option<LettaResponse> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_agent() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let mut cmd_loop = CommandLoop::new(SilentChannel, RecordingTerminal::default(), settings())
            .with_cancellation(cancel);

        let err = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            cmd_loop.run_with_agent(&agent()),
        )
        .await
        .expect("cancellation should interrupt the agent request")
        .unwrap_err();
        let (_, terminal) = cmd_loop.into_parts();

        assert!(matches!(err.error, LoopError::Cancelled));
        assert_eq!(err.result.failure_mode, FailureMode::Cancelled);
        assert_eq!(err.result.iterations, 1);
        assert_eq!(err.result.commands_executed, 0);
        assert!(terminal.executed.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let slow_retry = LoopSettings {
            retry: RetryPolicy {
                max_retries: 3,
                base_delay_ms: 60_000,
                max_delay_ms: 60_000,
                exponential_base: 2.0,
            },
            ..settings()
        };
        let channel = ScriptedChannel::new(vec![None, turn(vec![completed()])]);
        let mut cmd_loop = CommandLoop::new(channel, RecordingTerminal::default(), slow_retry)
            .with_cancellation(cancel);

        let err = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            cmd_loop.run_with_agent(&agent()),
        )
        .await
        .expect("cancellation should interrupt the backoff sleep")
        .unwrap_err();
        let (channel, _) = cmd_loop.into_parts();

        assert!(matches!(err.error, LoopError::Cancelled));
        // Only the failed attempt went out; the retry never did
        assert_eq!(channel.prompts(), vec![BOOTSTRAP_PROMPT.to_string()]);
        assert_eq!(err.result.commands_executed, 0);
    }

    #[tokio::test]
    async fn test_terminal_failure_ends_run() {
        let channel = ScriptedChannel::new(vec![turn(vec![keys("ls")])]);
        let mut cmd_loop = CommandLoop::new(channel, FailingTerminal, settings());

        let err = cmd_loop.run_with_agent(&agent()).await.unwrap_err();
        assert!(matches!(err.error, LoopError::Terminal(_)));
    }

    #[tokio::test]
    async fn test_token_usage_is_accumulated() {
        let usage = LettaUsage {
            prompt_tokens: 1000,
            completion_tokens: 50,
            total_tokens: 1050,
            step_count: 1,
        };
        let channel = ScriptedChannel::new(vec![
            Some(LettaResponse {
                messages: vec![keys("ls")],
                usage: Some(usage),
                stop_reason: None,
            }),
            Some(LettaResponse {
                messages: vec![completed()],
                usage: Some(usage),
                stop_reason: None,
            }),
        ]);
        let mut cmd_loop = CommandLoop::new(channel, RecordingTerminal::default(), settings());

        let result = cmd_loop.run_with_agent(&agent()).await.unwrap();
        assert_eq!(result.total_input_tokens, 2000);
        assert_eq!(result.total_output_tokens, 100);
        assert_eq!(result.agent_id.as_deref(), Some("agent-123"));
    }

    #[tokio::test]
    async fn test_run_bootstraps_agent() {
        let channel = ScriptedChannel::new(vec![turn(vec![completed()])]);
        let mut cmd_loop = CommandLoop::new(channel, RecordingTerminal::default(), settings());

        let result = cmd_loop
            .run("list the files", &StubBootstrap { fail: false })
            .await
            .unwrap();
        assert_eq!(result.agent_id.as_deref(), Some("agent-123"));

        let err = cmd_loop
            .run("list the files", &StubBootstrap { fail: true })
            .await
            .unwrap_err();
        assert!(matches!(err.error, LoopError::Bootstrap(_)));
        assert!(err.result.agent_id.is_none());
        assert_eq!(err.result.failure_mode, FailureMode::UnknownAgentError);
    }
}
