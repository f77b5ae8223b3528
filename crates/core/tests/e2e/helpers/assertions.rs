//! Polling assertions.

use std::time::Duration;

/// Default timeout for `wait_until`.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Polls `condition` every 10ms until it holds.
///
/// # Panics
///
/// Panics with `what` if `timeout` expires first.
pub async fn wait_until(what: &str, timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out after {timeout:?} waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
