//! State machine and naming rules for protected-file mutation.
//!
//! The protocol is linear:
//!
//! ```text
//! Start -> Validated -> BackedUp -> Written -> CompileChecked -> SmokeTested -> Committed
//!   |                     |           |             |
//!   v                     +-----------+-------------+--> Reverted
//! Blocked
//! ```
//!
//! `BackedUp -> Reverted` covers a failed write of the proposed content.

use serde::{Deserialize, Serialize};

/// Placeholder substituted with the protected file path in check commands.
pub const PROTECTED_PLACEHOLDER: &str = "{protected}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStage {
    Start,
    Validated,
    BackedUp,
    Written,
    CompileChecked,
    SmokeTested,
    Committed,
    Reverted,
    Blocked,
}

impl MutationStage {
    /// Next stage on the success path, `None` for terminal stages.
    pub fn next(self) -> Option<Self> {
        match self {
            MutationStage::Start => Some(MutationStage::Validated),
            MutationStage::Validated => Some(MutationStage::BackedUp),
            MutationStage::BackedUp => Some(MutationStage::Written),
            MutationStage::Written => Some(MutationStage::CompileChecked),
            MutationStage::CompileChecked => Some(MutationStage::SmokeTested),
            MutationStage::SmokeTested => Some(MutationStage::Committed),
            MutationStage::Committed | MutationStage::Reverted | MutationStage::Blocked => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.next().is_none()
    }

    /// Stages from which the original snapshot must be restored on failure.
    pub fn can_revert(self) -> bool {
        matches!(
            self,
            MutationStage::BackedUp | MutationStage::Written | MutationStage::CompileChecked
        )
    }

    /// Only an unvalidated attempt may be blocked; later failures revert.
    pub fn can_block(self) -> bool {
        self == MutationStage::Start
    }
}

/// Check (or step) whose failure triggered a revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStage {
    Write,
    Compile,
    SmokeTest,
}

impl CheckStage {
    pub fn label(self) -> &'static str {
        match self {
            CheckStage::Write => "write",
            CheckStage::Compile => "compile check",
            CheckStage::SmokeTest => "smoke test",
        }
    }
}

/// Backup file name for the `suffix`-th claim within one timestamp.
///
/// `suffix == 0` yields `<stem>_backup_<timestamp>.<ext>`; later claims append
/// `_<suffix>` so same-second attempts never overwrite each other.
pub fn backup_file_name(stem: &str, extension: Option<&str>, timestamp: &str, suffix: u32) -> String {
    let mut name = format!("{stem}_backup_{timestamp}");
    if suffix > 0 {
        name.push_str(&format!("_{suffix}"));
    }
    if let Some(ext) = extension.filter(|ext| !ext.is_empty()) {
        name.push('.');
        name.push_str(ext);
    }
    name
}

/// Substitute the protected file path into a check command template.
pub fn expand_check_command(template: &[String], protected: &str) -> Vec<String> {
    template
        .iter()
        .map(|arg| arg.replace(PROTECTED_PLACEHOLDER, protected))
        .collect()
}
