//! Logging initialization.
//!
//! The engine only emits `tracing` events; nothing is printed unless a
//! subscriber is installed. Call one of these once at process start.
//!
//! ```bash
//! # Per-connection detail
//! RUST_LOG=sonata_core=debug sonata 9006
//!
//! # Only warnings and errors
//! RUST_LOG=warn sonata 9006
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Human-readable logs, level from `RUST_LOG` (default `info`).
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Like [`init_logging`], falling back to `level` when `RUST_LOG` is unset.
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}

/// One JSON object per line, for log shippers.
pub fn init_logging_json() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
