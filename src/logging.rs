//! Opt-in tracing subscriber setup, gated behind the `logging` feature.
//!
//! The pool itself only *emits* tracing events (task spans, capacity
//! warnings, lifecycle); installing a subscriber is the application's call.
//! This helper wires up a sensible default for binaries that don't have one.

use tracing_subscriber::EnvFilter;

/// Installs a formatting subscriber filtered by `RUST_LOG`.
///
/// Panics if a global subscriber is already set.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}
