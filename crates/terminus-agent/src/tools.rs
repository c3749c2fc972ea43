//! Terminal tools registered with the agent
//!
//! The agent service only needs a schema and a stub body for each tool; the
//! calls are never executed server-side, the command loop reads them back
//! out of the agent's turn.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use terminus_core::ToolUpsert;

use crate::agent::{QUIT_PROCESS, SEND_KEYS, TASK_COMPLETED};

/// Schema for a tool parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterProperty {
    /// Parameter type (string, number, boolean)
    #[serde(rename = "type")]
    pub param_type: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParameterProperty {
    pub fn string(description: impl Into<String>) -> Self {
        Self {
            param_type: "string".to_string(),
            description: description.into(),
            default: None,
        }
    }

    pub fn number(description: impl Into<String>) -> Self {
        Self {
            param_type: "number".to_string(),
            description: description.into(),
            default: None,
        }
    }

    pub fn boolean(description: impl Into<String>) -> Self {
        Self {
            param_type: "boolean".to_string(),
            description: description.into(),
            default: None,
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// Schema describing tool parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Type is always "object"
    #[serde(rename = "type")]
    pub schema_type: String,
    pub properties: BTreeMap<String, ParameterProperty>,
    #[serde(default)]
    pub required: Vec<String>,
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self {
            schema_type: "object".to_string(),
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, prop: ParameterProperty) -> Self {
        self.properties.insert(name.into(), prop);
        self
    }

    pub fn with_required(mut self, name: impl Into<String>, prop: ParameterProperty) -> Self {
        let name = name.into();
        self.properties.insert(name.clone(), prop);
        self.required.push(name);
        self
    }
}

impl Default for ParameterSchema {
    fn default() -> Self {
        Self::new()
    }
}

/// Function definition in the shape Letta expects for `json_schema`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: ParameterSchema,
}

/// A tool the agent calls to drive the terminal
#[derive(Debug, Clone)]
pub struct TerminalTool {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: ParameterSchema,
    pub source_code: &'static str,
}

impl TerminalTool {
    pub fn to_definition(&self) -> FunctionDefinition {
        FunctionDefinition {
            name: self.name.to_string(),
            description: self.description.to_string(),
            parameters: self.parameters.clone(),
        }
    }

    pub fn to_upsert(&self) -> serde_json::Result<ToolUpsert> {
        Ok(ToolUpsert {
            source_code: self.source_code.to_string(),
            json_schema: serde_json::to_value(self.to_definition())?,
            description: self.description.to_string(),
        })
    }
}

const SEND_KEYS_SOURCE: &str = r#"def send_keys(keys: str, newline: bool = True, time_limit: float = 10.0) -> None:
    """
    Send keys to the terminal to execute a command.

    Args:
        keys (str): The keys to send to the terminal.
        newline (bool): Whether to add a newline to the end of the keys.
        time_limit (float): Seconds to allow the command before the terminal is captured.

    Returns:
        None
    """
    return None
"#;

const TASK_COMPLETED_SOURCE: &str = r#"def task_completed() -> None:
    """
    Indicate that the task is complete.

    Returns:
        None
    """
    return None
"#;

const QUIT_PROCESS_SOURCE: &str = r#"def quit_process() -> None:
    """
    Quit the current foreground process by sending Ctrl-c to the terminal.

    Returns:
        None
    """
    return None
"#;

/// The tools the command loop understands
pub fn terminal_tools() -> Vec<TerminalTool> {
    vec![
        TerminalTool {
            name: SEND_KEYS,
            description: "Send keys to the terminal to execute a command.",
            parameters: ParameterSchema::new()
                .with_required("keys", ParameterProperty::string("The keys to send to the terminal."))
                .with_property(
                    "newline",
                    ParameterProperty::boolean("Whether to add a newline to the end of the keys.")
                        .with_default(Value::Bool(true)),
                )
                .with_property(
                    "time_limit",
                    ParameterProperty::number(
                        "Seconds to allow the command before the terminal is captured.",
                    ),
                ),
            source_code: SEND_KEYS_SOURCE,
        },
        TerminalTool {
            name: TASK_COMPLETED,
            description: "Indicate that the task is complete.",
            parameters: ParameterSchema::new(),
            source_code: TASK_COMPLETED_SOURCE,
        },
        TerminalTool {
            name: QUIT_PROCESS,
            description: "Quit the current foreground process by sending Ctrl-c to the terminal.",
            parameters: ParameterSchema::new(),
            source_code: QUIT_PROCESS_SOURCE,
        },
    ]
}
