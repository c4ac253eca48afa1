//! Signal handling for the launcher
//!
//! SIGINT and SIGTERM clear a shared `running` flag. Server loops check the
//! flag between blocking polls and stop early.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

static RUNNING_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

/// Register SIGINT and SIGTERM handlers that clear `running`.
///
/// Only the first registration in a process takes effect; later calls
/// return false.
///
/// # Example
/// ```ignore
/// let running = Arc::new(AtomicBool::new(true));
/// setup_signal_handlers(running.clone());
///
/// while running.load(Ordering::Relaxed) {
///     // Server loop
/// }
/// ```
pub fn setup_signal_handlers(running: Arc<AtomicBool>) -> bool {
    if RUNNING_FLAG.set(running).is_err() {
        return false;
    }

    #[cfg(unix)]
    {
        use libc::{SIGINT, SIGTERM};
        unsafe {
            libc::signal(SIGINT, shutdown_signal_handler as libc::sighandler_t);
            libc::signal(SIGTERM, shutdown_signal_handler as libc::sighandler_t);
        }
        tracing::debug!("SIGINT/SIGTERM handlers registered");
    }
    true
}

#[cfg(unix)]
extern "C" fn shutdown_signal_handler(_: libc::c_int) {
    // Only async-signal-safe work here: a single atomic store.
    if let Some(flag) = RUNNING_FLAG.get() {
        flag.store(false, Ordering::Relaxed);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_signal_clears_flag() {
        let running = Arc::new(AtomicBool::new(true));
        assert!(setup_signal_handlers(running.clone()));
        assert!(!setup_signal_handlers(Arc::new(AtomicBool::new(true))));

        unsafe {
            libc::raise(libc::SIGTERM);
        }
        assert!(!running.load(Ordering::Relaxed));
    }
}
