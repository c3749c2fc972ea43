//! Tool-call command loop
//!
//! Parses each agent turn into at most one terminal command and drives the
//! terminal until the agent calls `task_completed`.

mod command;
mod command_loop;
mod error;
mod parser;
mod state;

pub use command::Command;
pub use command_loop::CommandLoop;
pub use error::LoopError;
pub use parser::{QUIT_PROCESS, SEND_KEYS, TASK_COMPLETED, TERMINAL_TOOLS};
pub use state::{FailureMode, LoopSettings, RunResult};
