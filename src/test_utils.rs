//! Shared helpers for unit tests.

#![allow(missing_docs)]

#[cfg(all(test, feature = "tracing-integration"))]
static INIT_LOGGING: std::sync::Once = std::sync::Once::new();

/// Initialize test logging.
///
/// Safe to call multiple times; only the first call initializes. A no-op
/// unless the `tracing-integration` feature is enabled, in which case events
/// go to a `tracing_subscriber::fmt` writer honoring `RUST_LOG`.
pub fn init_test_logging() {
    #[cfg(all(test, feature = "tracing-integration"))]
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trace")),
            )
            .with_test_writer()
            .try_init();
    });
}
