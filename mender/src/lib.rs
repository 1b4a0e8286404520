//! Iterative, sandboxed self-repair of a source tree.
//!
//! Every discovered file goes through analysis, then repair and evaluation in
//! a loop until an objective verdict settles it or its iteration budget runs
//! out. The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (types, verdict policy, workflow
//!   state, structured output extraction). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (configuration, the mutation sandbox,
//!   subprocess collaborators, telemetry). Collaborators sit behind traits so
//!   tests can script them.
//!
//! [`agents`] turn collaborators into stage calls and [`workflow`] drives them.

pub mod agents;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workflow;
