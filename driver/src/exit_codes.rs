//! Stable exit codes for driver CLI commands.

/// Command succeeded, or `driver check` found the command allowed.
pub const OK: i32 = 0;
/// Invalid config, unreadable input, agent failure or any other error.
pub const INVALID: i32 = 1;
/// `driver check` found the command blocked by the whitelist.
pub const BLOCKED: i32 = 2;
