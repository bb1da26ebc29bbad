//! Shared pieces of the Duplex workspace: the error taxonomy every crate
//! returns, and process-wide log setup.

#![forbid(unsafe_code)]

pub mod error;

pub use error::{Error, Result, TimeoutKind};

/// Install the global `tracing` subscriber at `info` unless `RUST_LOG` says otherwise.
pub fn init_tracing() {
    init_tracing_with_default("info");
}

/// Install the global subscriber with `default_level` as the fallback filter.
///
/// Thread names are included so events logged from media worker threads
/// (`duplex-bus`, streaming threads) can be told apart from the session task.
/// A second call is a no-op.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .try_init();
}
