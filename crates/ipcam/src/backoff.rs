//! Exponential backoff with jitter, bounded by the total time spent sleeping.
//!
//! The policy is fixed: before retry `n` the executor sleeps `2^n` ms plus a
//! uniform jitter in `[0, 1000)` ms. The cap limits how long the executor is
//! willing to wait in total, not how many attempts it makes.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tracing::{debug, warn};

/// Upper bound (exclusive) of the random jitter added to every delay.
const JITTER_MS: u64 = 1000;

/// Value produced by a successful run, with the number of attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// The last error seen once the waiting budget ran out.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub error: E,
    pub attempts: u32,
    pub waited: Duration,
}

/// Retries a fallible operation until it succeeds or the next sleep would
/// push the cumulative waiting time past `max`.
#[derive(Debug, Clone, Copy)]
pub struct ExpBackoff {
    max: Duration,
}

impl ExpBackoff {
    pub fn new(max: Duration) -> Self {
        Self { max }
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub(crate) fn base_delay(attempt: u32) -> Duration {
        let exp = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(exp)
    }

    /// Delay before retry number `attempt`, jitter included.
    pub(crate) fn delay(attempt: u32) -> Duration {
        let jitter = rand::rng().random_range(0..JITTER_MS);
        Self::base_delay(attempt).saturating_add(Duration::from_millis(jitter))
    }

    /// Run `operation` until it succeeds or the budget is spent.
    ///
    /// The closure receives the 1-based attempt number. The first attempt is
    /// always made, and so is the first retry, so a single transient failure
    /// never exhausts the executor on its own.
    pub async fn run<F, Fut, T, E>(&self, mut operation: F) -> Result<Attempted<T>, Exhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt: u32 = 1;
        let mut waited = Duration::ZERO;

        loop {
            let error = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempts = attempt, "operation succeeded after retrying");
                    }
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                    });
                }
                Err(error) => error,
            };

            let delay = Self::delay(attempt);
            if attempt > 1 && waited.saturating_add(delay) > self.max {
                return Err(Exhausted {
                    error,
                    attempts: attempt,
                    waited,
                });
            }

            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "attempt failed, backing off"
            );
            tokio::time::sleep(delay).await;
            waited += delay;
            attempt = attempt.saturating_add(1);
        }
    }
}
