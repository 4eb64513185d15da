//! Shared helpers for integration tests.

use filament::{FiberManager, SimpleLoopController};
use std::sync::Once;
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

/// Initialize logging for integration tests; first call wins.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Drives the manager's loop whenever the controller asks for it, until the
/// engine reports no outstanding tasks.
///
/// # Panics
///
/// Panics if the engine still has tasks after five seconds, which in these
/// tests means a lost wakeup.
#[allow(dead_code)]
pub fn drive_until_idle(manager: &FiberManager, controller: &SimpleLoopController) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while manager.has_tasks() {
        if controller.take_pending() {
            manager.loop_until_no_ready();
        } else {
            assert!(Instant::now() < deadline, "engine still busy after 5s");
            std::thread::yield_now();
        }
    }
}
