//! Stable exit codes for vizloop CLI commands.

/// Command succeeded; `run` completed its goal.
pub const OK: i32 = 0;
/// Invalid config, reasoner failure or any other error.
pub const INVALID: i32 = 1;
/// `run` stopped because the iteration budget was exhausted.
pub const BUDGET_EXHAUSTED: i32 = 2;
/// `exec` ran the snippet but it failed (non-zero exit, timeout, launch error).
pub const EXEC_FAILED: i32 = 3;
/// `run` or `exec` was cancelled by SIGINT/SIGTERM before finishing.
pub const CANCELLED: i32 = 130;
