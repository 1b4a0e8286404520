//! Development-time tracing.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of the run record.
//!
//! - **Telemetry (`io/telemetry`)**: The product record of a run in
//!   `<log_dir>/experiment_data.json`. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `warn`, or `mender=info` when `verbose`.
/// Output: stderr, compact format.
///
/// # Panics
/// If a global subscriber is already installed. Call once, from `main`.
///
/// # Example
/// ```bash
/// RUST_LOG=mender=debug mender run --target-dir ./src
/// ```
pub fn init(verbose: bool) {
    let default = if verbose { "mender=info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
