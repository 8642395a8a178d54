//! Logging Infrastructure
//!
//! The heap logs through `tracing`. Segment traffic is emitted at `debug`,
//! per-slot traffic at `trace`, and programming errors (double frees,
//! duplicate keys on restore) at `error`. Embedders that already install a
//! subscriber need nothing from this module; [`init_logging`] is for hosts
//! and tests that want a plain fmt subscriber.

use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to the
/// configured level.
///
/// Returns false if a global subscriber was already installed.
pub fn init_logging(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}

fn default_directive(config: &LogConfig) -> String {
    format!("segvm_heap={}", config.level).to_ascii_lowercase()
}
