//! Result model returned for every dispatched action.
//!
//! Results serialize to the wire shape the agent sees: a `type` tag mirroring
//! the action, a `status`, an optional error `kind` and message, and the
//! variant payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::action::ActionType;
use crate::core::mutation::{CheckStage, MutationStage};

/// Terminal status of one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Error,
    Blocked,
    Reverted,
}

/// Failure class attached to every non-ok status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing required field, malformed or unknown action.
    Validation,
    /// Whitelist miss, disabled capability, target mismatch, write outside
    /// writable subtrees.
    Policy,
    /// Filesystem error, spawn failure, nonzero exit.
    Execution,
    /// A subprocess exceeded its time budget.
    Timeout,
    /// Protected-file check failed or its restore failed.
    Mutation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Outcome {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            kind: None,
            error: None,
        }
    }

    pub fn failed(kind: ErrorKind, error: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            kind: Some(kind),
            error: Some(error.into()),
        }
    }

    pub fn blocked(error: impl Into<String>) -> Self {
        Self {
            status: Status::Blocked,
            kind: Some(ErrorKind::Policy),
            error: Some(error.into()),
        }
    }

    pub fn reverted(kind: ErrorKind, error: impl Into<String>) -> Self {
        Self {
            status: Status::Reverted,
            kind: Some(kind),
            error: Some(error.into()),
        }
    }
}

/// Captured output of a finished (or killed) subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandCapture {
    /// `None` when the process was killed by a signal or never started.
    pub returncode: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub timed_out: bool,
}

impl CommandCapture {
    pub fn success(&self) -> bool {
        !self.timed_out && self.returncode == Some(0)
    }

    /// Capture standing in for a process that could not be run at all.
    pub fn not_started(reason: impl Into<String>) -> Self {
        Self {
            returncode: None,
            stdout: String::new(),
            stderr: reason.into(),
            timed_out: false,
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Audit trail of one protected-file mutation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutationReport {
    /// Last protocol stage completed before the terminal transition.
    pub reached: MutationStage,
    /// Check that triggered a revert.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<CheckStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_result: Option<CommandCapture>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smoke_result: Option<CommandCapture>,
}

/// Outcome of one action, tagged with the action's wire type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionResult {
    ListDir {
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        items: Option<Vec<String>>,
        #[serde(flatten)]
        outcome: Outcome,
    },
    ReadFile {
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(flatten)]
        outcome: Outcome,
    },
    WriteFile {
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(flatten)]
        outcome: Outcome,
    },
    ModifyEngine {
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(flatten)]
        report: Option<MutationReport>,
        #[serde(flatten)]
        outcome: Outcome,
    },
    RunCommand {
        #[serde(skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        #[serde(flatten)]
        capture: Option<CommandCapture>,
        #[serde(flatten)]
        outcome: Outcome,
    },
    Unknown {
        raw_action: Value,
        #[serde(flatten)]
        outcome: Outcome,
    },
}

impl ActionResult {
    /// Validation failure for a known action type whose fields were unusable.
    pub fn malformed(
        action_type: ActionType,
        target: Option<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::failed(action_type, target, ErrorKind::Validation, reason)
    }

    /// Error result of `action_type` with no payload beyond its target, the
    /// requested path (or command) when one is known.
    pub fn failed(
        action_type: ActionType,
        target: Option<String>,
        kind: ErrorKind,
        reason: impl Into<String>,
    ) -> Self {
        let outcome = Outcome::failed(kind, reason);
        match action_type {
            ActionType::ListDir => ActionResult::ListDir {
                path: target,
                items: None,
                outcome,
            },
            ActionType::ReadFile => ActionResult::ReadFile {
                path: target,
                content: None,
                outcome,
            },
            ActionType::WriteFile => ActionResult::WriteFile {
                path: target,
                outcome,
            },
            ActionType::ModifyEngine => ActionResult::ModifyEngine {
                path: target,
                report: None,
                outcome,
            },
            ActionType::RunCommand => ActionResult::RunCommand {
                command: target,
                capture: None,
                outcome,
            },
        }
    }

    pub fn unknown(raw_action: Value) -> Self {
        let label = raw_action
            .get("type")
            .map(|kind| match kind {
                Value::String(kind) => kind.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| "<missing>".to_string());
        ActionResult::Unknown {
            raw_action,
            outcome: Outcome::failed(
                ErrorKind::Validation,
                format!("unknown action type: {label}"),
            ),
        }
    }

    pub fn outcome(&self) -> &Outcome {
        match self {
            ActionResult::ListDir { outcome, .. }
            | ActionResult::ReadFile { outcome, .. }
            | ActionResult::WriteFile { outcome, .. }
            | ActionResult::ModifyEngine { outcome, .. }
            | ActionResult::RunCommand { outcome, .. }
            | ActionResult::Unknown { outcome, .. } => outcome,
        }
    }

    pub fn status(&self) -> Status {
        self.outcome().status
    }

    pub fn type_label(&self) -> &'static str {
        match self {
            ActionResult::ListDir { .. } => ActionType::ListDir.as_str(),
            ActionResult::ReadFile { .. } => ActionType::ReadFile.as_str(),
            ActionResult::WriteFile { .. } => ActionType::WriteFile.as_str(),
            ActionResult::ModifyEngine { .. } => ActionType::ModifyEngine.as_str(),
            ActionResult::RunCommand { .. } => ActionType::RunCommand.as_str(),
            ActionResult::Unknown { .. } => "unknown",
        }
    }
}
