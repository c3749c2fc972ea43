//! Turns an agent's tool calls into a terminal command
//!
//! Each category is found by scanning the turn's events from newest to
//! oldest, so only the latest intent counts:
//!
//! - `quit_process` anywhere in the turn wins over every `send_keys`.
//! - Otherwise the latest `send_keys` becomes the command. If its arguments
//!   cannot be decoded the turn carries no command and the failure is
//!   reported in [`ParsedTurn::malformed`]; earlier calls are not used.
//! - `task_completed` is looked up independently of the command.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use terminus_core::{LettaMessage, ToolCall};

use super::command::{ArgumentError, Command, ParsedTurn};

pub const SEND_KEYS: &str = "send_keys";
pub const TASK_COMPLETED: &str = "task_completed";
pub const QUIT_PROCESS: &str = "quit_process";

/// Tool names the parser acts on
pub const TERMINAL_TOOLS: [&str; 3] = [SEND_KEYS, TASK_COMPLETED, QUIT_PROCESS];

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct SendKeysArgs {
    keys: String,
    #[serde(default = "default_newline")]
    newline: bool,
    #[serde(default)]
    time_limit: Option<f64>,
}

fn default_newline() -> bool {
    true
}

/// Stateless parser for agent turns
#[derive(Debug, Clone)]
pub struct ResponseParser {
    default_timeout: Duration,
    interrupt_timeout: Duration,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            interrupt_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ResponseParser {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            ..Default::default()
        }
    }

    /// Parse the events of one turn, oldest first
    pub fn parse(&self, events: &[LettaMessage]) -> ParsedTurn {
        let completed = latest_call(events, TASK_COMPLETED).is_some();

        if latest_call(events, QUIT_PROCESS).is_some() {
            return ParsedTurn {
                command: Some(Command::interrupt(self.interrupt_timeout)),
                completed,
                abort: true,
                malformed: None,
            };
        }

        let Some(call) = latest_call(events, SEND_KEYS) else {
            return ParsedTurn {
                completed,
                ..Default::default()
            };
        };

        match self.send_keys_command(call) {
            Ok(command) => ParsedTurn {
                command: Some(command),
                completed,
                abort: false,
                malformed: None,
            },
            Err(e) => ParsedTurn {
                command: None,
                completed,
                abort: false,
                malformed: Some(e),
            },
        }
    }

    fn send_keys_command(&self, call: &ToolCall) -> Result<Command, ArgumentError> {
        let args: SendKeysArgs = decode_arguments(SEND_KEYS, call)?;

        let mut keystrokes = args.keys;
        if args.newline {
            keystrokes.push('\n');
        }

        let timeout = args
            .time_limit
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or(self.default_timeout);

        Ok(Command::keys(keystrokes, timeout))
    }
}

/// Most recent invocation of `name`
fn latest_call<'a>(events: &'a [LettaMessage], name: &str) -> Option<&'a ToolCall> {
    events
        .iter()
        .rev()
        .flat_map(|event| event.tool_calls().into_iter().rev())
        .find(|call| call.is_named(name))
}

/// Decode a tool call's arguments into `T`; they must form a JSON object
fn decode_arguments<T: for<'de> Deserialize<'de>>(
    tool: &str,
    call: &ToolCall,
) -> Result<T, ArgumentError> {
    let raw = call.arguments.as_ref().ok_or_else(|| ArgumentError::Missing {
        tool: tool.to_string(),
    })?;

    let value = match raw {
        Value::String(encoded) => {
            serde_json::from_str::<Value>(encoded).map_err(|e| ArgumentError::InvalidJson {
                tool: tool.to_string(),
                reason: e.to_string(),
            })?
        }
        other => other.clone(),
    };

    if !value.is_object() {
        return Err(ArgumentError::NotAnObject {
            tool: tool.to_string(),
            found: json_kind(&value),
        });
    }

    serde_json::from_value(value).map_err(|e| ArgumentError::InvalidField {
        tool: tool.to_string(),
        reason: e.to_string(),
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
