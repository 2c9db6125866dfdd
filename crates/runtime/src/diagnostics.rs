//! Runtime diagnostics
//!
//! A SIGQUIT (kill -3) handler dumps scheduler statistics to stderr so a
//! stuck production process can be inspected without stopping it. The
//! counters are lock-free atomics maintained by the scheduler.

use crate::scheduler::{
    ACTIVE_THREADS, PEAK_THREADS, TOTAL_THREADS_COMPLETED, TOTAL_THREADS_SPAWNED,
};
use std::sync::atomic::Ordering;
use std::sync::Once;

static SIGNAL_HANDLER_INIT: Once = Once::new();

/// Install the SIGQUIT handler. Called by the scheduler on first run;
/// idempotent.
pub fn install_signal_handler() {
    SIGNAL_HANDLER_INIT.call_once(|| {
        #[cfg(unix)]
        {
            unsafe {
                let _ = signal_hook::low_level::register(signal_hook::consts::SIGQUIT, || {
                    dump_diagnostics();
                });
            }
        }
    });
}

/// Dump scheduler statistics to stderr. Callable directly or via SIGQUIT.
pub fn dump_diagnostics() {
    use std::io::Write;
    let mut out = std::io::stderr().lock();
    let _ = writeln!(out, "\n=== Horse64 Runtime Diagnostics ===");
    let _ = writeln!(
        out,
        "threads: {} active, {} spawned, {} completed, {} peak",
        ACTIVE_THREADS.load(Ordering::Relaxed),
        TOTAL_THREADS_SPAWNED.load(Ordering::Relaxed),
        TOTAL_THREADS_COMPLETED.load(Ordering::Relaxed),
        PEAK_THREADS.load(Ordering::Relaxed),
    );
    let _ = writeln!(out, "=== End Diagnostics ===\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_is_idempotent() {
        install_signal_handler();
        install_signal_handler();
    }

    #[test]
    fn test_dump_does_not_panic() {
        dump_diagnostics();
    }
}
