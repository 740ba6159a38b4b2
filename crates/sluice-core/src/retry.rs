//! Retry policy: exponential backoff with jitter, bounded by attempts and
//! elapsed time.

use std::future::Future;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::config::RetrySpec;
use crate::error::{EtlError, Result};

/// Classification of one attempt of a fallible stage operation.
#[derive(Debug)]
pub enum Attempt<T> {
    Ok(T),
    Retryable(EtlError),
    Fatal(EtlError),
}

impl<T> From<Result<T>> for Attempt<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(v) => Attempt::Ok(v),
            Err(e) if e.is_retryable() => Attempt::Retryable(e),
            Err(e) => Attempt::Fatal(e),
        }
    }
}

/// Backoff parameters resolved from [`RetrySpec`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub max_elapsed: Duration,
}

impl From<&RetrySpec> for RetryPolicy {
    fn from(spec: &RetrySpec) -> Self {
        Self {
            max_retries: spec.max_retries,
            base_delay: Duration::from_millis(spec.base_delay_ms),
            max_delay: Duration::from_millis(spec.max_delay_ms),
            multiplier: spec.multiplier,
            jitter: spec.jitter,
            max_elapsed: Duration::from_millis(spec.max_elapsed_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySpec::default())
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based).
    ///
    /// `base * multiplier^(attempt-1)` capped at `max_delay`, plus up to
    /// `jitter` of that amount. The jitter fraction is derived from
    /// `jitter_key` and the attempt, so a given run retries on the same
    /// schedule every time it is replayed.
    pub fn delay_for(&self, attempt: u32, jitter_key: &str) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let raw = self.base_delay.as_secs_f64() * exp;
        let capped = raw.min(self.max_delay.as_secs_f64());
        let jittered = capped * (1.0 + self.jitter * unit_fraction(jitter_key, attempt));
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64() * (1.0 + self.jitter)))
    }

    /// Run `op` until it succeeds, fails fatally, or the budget runs out.
    ///
    /// `retries` is incremented for every retry performed. A retryable
    /// error's own `retry_after` hint replaces the computed delay. When
    /// `cancel` fires during a backoff sleep the last error is returned.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        jitter_key: &str,
        cancel: &CancellationToken,
        retries: &mut u32,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        let mut first_failure: Option<Instant> = None;

        loop {
            let err = match Attempt::from(op().await) {
                Attempt::Ok(value) => return Ok(value),
                Attempt::Fatal(err) => return Err(err),
                Attempt::Retryable(err) => err,
            };

            attempt += 1;
            let started = *first_failure.get_or_insert_with(Instant::now);
            let delay = err
                .retry_after()
                .unwrap_or_else(|| self.delay_for(attempt, jitter_key));

            if attempt > self.max_retries || started.elapsed() + delay > self.max_elapsed {
                error!(
                    operation,
                    key = jitter_key,
                    attempts = attempt,
                    max_retries = self.max_retries,
                    error = %err,
                    "Retry budget exhausted"
                );
                return Err(err);
            }

            #[allow(clippy::cast_possible_truncation)]
            let delay_ms = delay.as_millis() as u64;
            warn!(
                operation,
                key = jitter_key,
                attempt,
                max_retries = self.max_retries,
                delay_ms,
                kind = err.kind(),
                error = %err,
                "Retryable error, will retry"
            );
            *retries += 1;

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(err),
            }
        }
    }
}

/// Deterministic value in `[0, 1)` derived from a key and attempt number.
fn unit_fraction(key: &str, attempt: u32) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(attempt.to_le_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_le_bytes(head) >> 11) as f64 / (1u64 << 53) as f64
}
