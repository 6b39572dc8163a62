//! Unbounded retry with exponential backoff.
//!
//! Cascading store updates (lease release, bulk status changes) must never
//! be abandoned half-way, so transient failures are retried forever. Errors
//! that are not transient are returned to the caller on first sight.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Classifies an error as worth retrying.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Exponential backoff state. The delay doubles after every failure and
/// is never capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration) -> Self {
        Self { current: initial }
    }

    /// Return the delay to wait now and double it for the next call.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2);
        delay
    }
}

/// Run `op` until it succeeds or fails with a non-transient error.
pub async fn retry_until_success<T, E, F, Fut>(
    what: &str,
    initial: Duration,
    mut op: F,
) -> Result<T, E>
where
    E: Transient + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = Backoff::new(initial);
    let mut attempt: u32 = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                let delay = backoff.next_delay();
                warn!(
                    operation = what,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "store operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt = attempt.saturating_add(1);
            }
            Err(e) => return Err(e),
        }
    }
}

/// [`retry_until_success`] for an operation that completes synchronously,
/// such as a single store call.
pub async fn retry_sync<T, E, F>(what: &str, initial: Duration, mut op: F) -> Result<T, E>
where
    E: Transient + std::fmt::Display,
    F: FnMut() -> Result<T, E>,
{
    retry_until_success(what, initial, || std::future::ready(op())).await
}
