//! Diagnostic logging setup.
//!
//! User-facing CLI output stays on stdout via `println!`; everything else
//! (job exits, cleanup failures, dropped rows) goes through `tracing` on stderr.

use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. Filter comes from `FORECAST_LOG`, then
/// `RUST_LOG`, then defaults to `info`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("FORECAST_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
