//! Retry-until-result primitive.
//!
//! The single mechanism for turning "check again later" into a cancellable
//! loop: probe, and if the probe yields nothing, sleep a fixed interval and
//! probe again. Used for balance polling, contract-state polling, and fee
//! probing.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Options controlling one retry loop.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub interval: Duration,
    /// `None` retries indefinitely.
    pub max_attempts: Option<u64>,
}

impl RetryOptions {
    pub fn new(interval: Duration, max_attempts: Option<u64>) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }
}

/// Handle a probe can use to stop its own loop without producing a result.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Repeatedly invokes `probe` until it yields a value.
///
/// Yields `None` when the probe called [`StopHandle::stop`], when `cancelled`
/// returned true at an iteration boundary, or when `max_attempts` ran out.
/// Cancellation is cooperative only: an in-flight probe is never aborted, its
/// result is simply discarded.
pub async fn repeat_until_result<T, C, F, Fut>(
    options: &RetryOptions,
    cancelled: C,
    mut probe: F,
) -> Option<T>
where
    C: Fn() -> bool,
    F: FnMut(StopHandle) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let handle = StopHandle::default();
    let mut attempts: u64 = 0;

    loop {
        if cancelled() || handle.is_stopped() {
            return None;
        }
        if let Some(max) = options.max_attempts {
            if attempts >= max {
                debug!(attempts, "retry loop exhausted");
                return None;
            }
        }
        attempts += 1;

        let result = probe(handle.clone()).await;
        if handle.is_stopped() || cancelled() {
            return None;
        }
        if let Some(value) = result {
            return Some(value);
        }

        tokio::time::sleep(options.interval).await;
    }
}
