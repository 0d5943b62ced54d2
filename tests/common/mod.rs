//! Shared helpers for integration tests.

use tracing_subscriber::EnvFilter;

/// Install a test-friendly tracing subscriber once per test binary.
///
/// Log level comes from `RUST_LOG`, defaulting to `stepwise=debug`.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stepwise=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_test_writer()
        .try_init();
}
