//! Polling helpers for state that changes on a background thread.

use std::{
    thread,
    time::{Duration, Instant},
};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Polls `condition` until it holds or `timeout` passes.
///
/// Returns whether the condition held. Prefer this over a fixed sleep when
/// waiting on a timer-driven worker.
///
/// # Example
///
/// ```
/// use std::sync::{Arc, atomic::{AtomicBool, Ordering}};
/// use std::time::Duration;
/// use fbdb_test_utils::wait_until;
///
/// let flag = Arc::new(AtomicBool::new(false));
/// let setter = Arc::clone(&flag);
/// std::thread::spawn(move || setter.store(true, Ordering::SeqCst));
///
/// assert!(wait_until(Duration::from_secs(5), || flag.load(Ordering::SeqCst)));
/// ```
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(POLL_INTERVAL);
    }
    condition()
}
