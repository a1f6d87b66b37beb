//! Action model and total parsing from agent-supplied JSON.
//!
//! Every JSON value maps to exactly one [`Action`]. Values that name a known
//! type but lack a required field become [`Action::Malformed`]; anything else
//! that cannot be classified becomes [`Action::Unknown`]. Nothing is dropped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Wire-level action type (`type` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ListDir,
    ReadFile,
    WriteFile,
    ModifyEngine,
    RunCommand,
}

impl ActionType {
    pub const ALL: [ActionType; 5] = [
        ActionType::ListDir,
        ActionType::ReadFile,
        ActionType::WriteFile,
        ActionType::ModifyEngine,
        ActionType::RunCommand,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::ListDir => "list_dir",
            ActionType::ReadFile => "read_file",
            ActionType::WriteFile => "write_file",
            ActionType::ModifyEngine => "modify_engine",
            ActionType::RunCommand => "run_command",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }
}

/// One requested operation from the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    ListDirectory {
        path: String,
    },
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        content: String,
    },
    ModifyProtectedFile {
        path: String,
        content: String,
    },
    RunCommand {
        command: String,
    },
    /// Known type with a missing, empty, or mistyped field.
    Malformed {
        action_type: ActionType,
        raw: Value,
        reason: String,
    },
    /// Missing or unrecognized type, or a payload that is not an object.
    Unknown {
        raw: Value,
    },
}

impl Action {
    /// Classify a raw JSON action. Never fails.
    pub fn from_value(raw: &Value) -> Self {
        let Some(object) = raw.as_object() else {
            return Action::Unknown { raw: raw.clone() };
        };
        let Some(action_type) = object
            .get("type")
            .and_then(Value::as_str)
            .and_then(ActionType::parse)
        else {
            return Action::Unknown { raw: raw.clone() };
        };

        parse_fields(action_type, object).unwrap_or_else(|reason| Action::Malformed {
            action_type,
            raw: raw.clone(),
            reason,
        })
    }

    /// Requested path, or command for `run_command`. Malformed actions report
    /// whichever of the two the raw payload carries as a string.
    pub fn target(&self) -> Option<&str> {
        match self {
            Action::ListDirectory { path }
            | Action::ReadFile { path }
            | Action::WriteFile { path, .. }
            | Action::ModifyProtectedFile { path, .. } => Some(path),
            Action::RunCommand { command } => Some(command),
            Action::Malformed { raw, .. } => raw
                .get("path")
                .and_then(Value::as_str)
                .or_else(|| raw.get("command").and_then(Value::as_str)),
            Action::Unknown { .. } => None,
        }
    }

    /// Wire type label, `unknown` for unclassifiable payloads.
    pub fn type_label(&self) -> &'static str {
        match self {
            Action::ListDirectory { .. } => ActionType::ListDir.as_str(),
            Action::ReadFile { .. } => ActionType::ReadFile.as_str(),
            Action::WriteFile { .. } => ActionType::WriteFile.as_str(),
            Action::ModifyProtectedFile { .. } => ActionType::ModifyEngine.as_str(),
            Action::RunCommand { .. } => ActionType::RunCommand.as_str(),
            Action::Malformed { action_type, .. } => action_type.as_str(),
            Action::Unknown { .. } => "unknown",
        }
    }
}

fn parse_fields(action_type: ActionType, object: &Map<String, Value>) -> Result<Action, String> {
    match action_type {
        ActionType::ListDir => {
            let path = match optional_str(object, "path")? {
                None => ".".to_string(),
                Some(path) if path.trim().is_empty() => return Err("empty path".to_string()),
                Some(path) => path,
            };
            Ok(Action::ListDirectory { path })
        }
        ActionType::ReadFile => Ok(Action::ReadFile {
            path: required_str(object, "path")?,
        }),
        ActionType::WriteFile => Ok(Action::WriteFile {
            path: required_str(object, "path")?,
            content: optional_str(object, "content")?.unwrap_or_default(),
        }),
        ActionType::ModifyEngine => Ok(Action::ModifyProtectedFile {
            path: required_str(object, "path")?,
            content: optional_str(object, "content")?.unwrap_or_default(),
        }),
        ActionType::RunCommand => {
            let command = optional_str(object, "command")?.unwrap_or_default();
            let command = command.trim();
            if command.is_empty() {
                return Err("empty command".to_string());
            }
            Ok(Action::RunCommand {
                command: command.to_string(),
            })
        }
    }
}

fn required_str(object: &Map<String, Value>, field: &str) -> Result<String, String> {
    match optional_str(object, field)? {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(format!("missing {field}")),
    }
}

fn optional_str(object: &Map<String, Value>, field: &str) -> Result<Option<String>, String> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(other) => Err(format!(
            "{field} must be a string, got {}",
            json_type_name(other)
        )),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
