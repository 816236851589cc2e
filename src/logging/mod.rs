//! Logging initialization for the proxy

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Initialize the global logger at `info` level. Safe to call more than
/// once; only the first call takes effect.
pub fn init_logger() {
    init_with_filter(EnvFilter::new("info"));
}

/// Initialize the global logger from `RUST_LOG`, falling back to `info`.
pub fn init_logger_with_env() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    init_with_filter(filter);
}

fn init_with_filter(filter: EnvFilter) {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    });
}
