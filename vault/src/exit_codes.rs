//! Stable exit codes for vault CLI commands.

/// Command succeeded; for `vault loop`, the goal completed.
pub const OK: i32 = 0;
/// Command failed due to invalid input, config, or vault state, or any other error.
pub const INVALID: i32 = 1;
/// `vault loop` exhausted its iteration budget without completion evidence.
pub const INCOMPLETE: i32 = 2;
