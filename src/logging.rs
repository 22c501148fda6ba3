//! Logging setup.
//!
//! Library code only emits `tracing` events; installing a subscriber is up to
//! the embedding process. `RUST_LOG` overrides the default level.

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber, `debug` when `verbose` and `info` otherwise.
///
/// Returns false when a global subscriber was already installed.
pub fn init(verbose: bool) -> bool {
    let log_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .try_init()
        .is_ok()
}

/// Install a JSON subscriber for machine-readable logs.
pub fn init_json(verbose: bool) -> bool {
    let log_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .try_init()
        .is_ok()
}
