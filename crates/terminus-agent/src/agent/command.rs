//! Terminal commands and per-turn parse results

use std::time::Duration;

use thiserror::Error;

/// Keys sent to interrupt the foreground process
pub const INTERRUPT_KEYS: &str = "C-c";

/// One atomic instruction for the terminal
///
/// Agent turns only ever produce non-blocking commands. Executors still
/// honour `blocking`: [`crate::terminal::TmuxExecutor`] waits for the shell to
/// finish a blocking command (up to `timeout`) instead of sleeping briefly.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub keystrokes: String,
    pub timeout: Duration,
    pub blocking: bool,
}

impl Command {
    /// Non-blocking keystrokes
    pub fn keys(keystrokes: impl Into<String>, timeout: Duration) -> Self {
        Self {
            keystrokes: keystrokes.into(),
            timeout,
            blocking: false,
        }
    }

    /// Ctrl-C for the foreground process
    pub fn interrupt(timeout: Duration) -> Self {
        Self::keys(INTERRUPT_KEYS, timeout)
    }
}

/// Why a tool call's arguments could not be turned into a command
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgumentError {
    #[error("{tool} call has no arguments")]
    Missing { tool: String },

    #[error("{tool} arguments are not valid JSON: {reason}")]
    InvalidJson { tool: String, reason: String },

    #[error("{tool} arguments are not an object (got {found})")]
    NotAnObject { tool: String, found: &'static str },

    #[error("{tool} arguments have the wrong shape: {reason}")]
    InvalidField { tool: String, reason: String },
}

/// What one agent turn asked for
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedTurn {
    /// At most one command; an interrupt when `abort` is set
    pub command: Option<Command>,
    pub completed: bool,
    pub abort: bool,
    /// Set when the latest send_keys call could not be decoded
    pub malformed: Option<ArgumentError>,
}

impl ParsedTurn {
    /// Whether the turn produced anything for the loop to act on
    pub fn is_actionable(&self) -> bool {
        self.command.is_some() || self.completed
    }
}
