//! Stable exit codes for `gatepass` CLI commands.

/// Command succeeded; for `run`, the gatepass was submitted.
pub const OK: i32 = 0;
/// Invalid configuration, credentials or layout, or any other error.
pub const INVALID: i32 = 1;
/// `gatepass run` used every attempt without a successful submission.
pub const EXHAUSTED: i32 = 2;
/// `gatepass run` could not start the automation environment, or was stopped.
pub const FATAL: i32 = 3;
