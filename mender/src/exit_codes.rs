//! Stable exit codes for `mender` commands.

/// Command succeeded; for `run`, every file settled as success or none were found.
pub const OK: i32 = 0;
/// `mender run` finished but at least one file settled as failed.
pub const PARTIAL: i32 = 1;
/// Invalid configuration, bad arguments or an aborted run.
pub const INVALID: i32 = 2;
/// The run was interrupted (Ctrl-C).
pub const INTERRUPTED: i32 = 130;
