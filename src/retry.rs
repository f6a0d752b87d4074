//! Retry policy for upstream requests.
//!
//! Only [`FailureKind::Transient`](crate::error::FailureKind) failures are retried.
//! The default policy never gives up and waits a fixed minute between attempts.
use serde::Deserialize;
use std::{future::Future, iter, time::Duration};
use tokio::time::Instant;
use tokio_retry::strategy::{ExponentialBackoff, FixedInterval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::FetchError;

/// Delay between attempts when nothing else is configured.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);

/// A value together with the number of attempts it took to obtain it.
#[derive(Clone, Debug, PartialEq)]
pub struct Fetched<T> {
    /// The decoded value.
    pub value: T,
    /// 1 when the first attempt succeeded.
    pub attempts: u32,
}

impl<T> Fetched<T> {
    /// Number of failed attempts before success.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    /// Transform the value, keeping the attempt count.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Fetched<U> {
        Fetched {
            value: f(self.value),
            attempts: self.attempts,
        }
    }
}

/// Delay schedule between attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay every time.
    Fixed(Duration),
    /// Starts at `initial`, doubles each retry, capped at `max`.
    Exponential {
        /// First delay.
        initial: Duration,
        /// Ceiling.
        max: Duration,
    },
}

/// Config-level name of a [`Backoff`] shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// See [`Backoff::Fixed`].
    #[default]
    Fixed,
    /// See [`Backoff::Exponential`].
    Exponential,
}

/// How many times to try and how long to wait in between.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Delay schedule.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded(Backoff::Fixed(DEFAULT_RETRY_DELAY))
    }
}

impl RetryPolicy {
    /// Never give up.
    pub fn unbounded(backoff: Backoff) -> Self {
        Self {
            max_attempts: None,
            backoff,
        }
    }

    /// Give up after `max_attempts` tries (at least one).
    pub fn bounded(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            backoff,
        }
    }

    /// Zero-delay bounded policy, for tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::bounded(max_attempts, Backoff::Fixed(Duration::ZERO))
    }

    /// Delays to sleep before attempt 2, 3, ...; ends when the attempt budget is spent.
    pub fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        let schedule: Box<dyn Iterator<Item = Duration> + Send> = match self.backoff {
            Backoff::Fixed(d) => Box::new(FixedInterval::new(d)),
            Backoff::Exponential { initial, max } => {
                // base 2 with factor `initial` yields 2*initial, 4*initial, ...
                let factor = u64::try_from(initial.as_millis()).unwrap_or(u64::MAX);
                let doubling = ExponentialBackoff::from_millis(2).factor(factor).max_delay(max);
                Box::new(iter::once(initial.min(max)).chain(doubling))
            }
        };
        match self.max_attempts {
            Some(n) => Box::new(schedule.take(n.saturating_sub(1) as usize)),
            None => schedule,
        }
    }

    /// Run `op` until it succeeds, fails non-transiently, exhausts the policy, or `cancel` fires.
    ///
    /// Each attempt logs one line with its outcome and latency. The backoff sleep is
    /// an async timer raced against `cancel`, so it never blocks other in-flight work.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        what: &str,
        mut op: F,
    ) -> Result<Fetched<T>, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut delays = self.delays();
        let mut attempts = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            attempts += 1;
            let started = Instant::now();
            let err = match op().await {
                Ok(value) => {
                    debug!(
                        request = what,
                        attempt = attempts,
                        latency_ms = started.elapsed().as_millis() as u64,
                        "request ok"
                    );
                    return Ok(Fetched { value, attempts });
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => e,
            };

            let Some(delay) = delays.next() else {
                warn!(request = what, attempts, error = %err, "retries exhausted");
                return Err(FetchError::RetriesExhausted {
                    attempts,
                    last: Box::new(err),
                });
            };
            warn!(
                request = what,
                attempt = attempts,
                latency_ms = started.elapsed().as_millis() as u64,
                error = %err,
                "request failed, retrying in {:?}",
                delay
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
