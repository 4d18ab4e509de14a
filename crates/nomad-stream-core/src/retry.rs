//! Retry configuration, backoff calculation and the retry loop.
//!
//! Attempts are numbered from 1. After a retryable failure on attempt
//! `n` the loop sleeps `min(delay_base * 2^(n-1), max_backoff_delay)`
//! (or `fixed_delay` when set) before attempt `n + 1`.

use std::{fmt::Display, future::Future, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::traits::{Cancelled, Retryable};

/// Default maximum number of attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 5;
/// Default base delay.
pub const DEFAULT_DELAY_BASE: Duration = Duration::from_secs(1);
/// Default cap on a single inter-attempt delay.
pub const DEFAULT_MAX_BACKOFF_DELAY: Duration = Duration::from_secs(5 * 60);

/// Retry configuration. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    max_retries: u32,
    #[serde(with = "crate::encoding::duration_ms")]
    delay_base: Duration,
    #[serde(with = "crate::encoding::duration_ms")]
    max_backoff_delay: Duration,
    #[serde(with = "crate::encoding::opt_duration_ms")]
    fixed_delay: Option<Duration>,
    #[serde(with = "crate::encoding::opt_duration_ms")]
    max_to_last_call: Option<Duration>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryOptions {
    /// Defaults: 5 attempts, 1s base delay, 5 minute cap.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            delay_base: DEFAULT_DELAY_BASE,
            max_backoff_delay: DEFAULT_MAX_BACKOFF_DELAY,
            fixed_delay: None,
            max_to_last_call: None,
        }
    }

    /// Maximum number of attempts; `0` retries until success or cancellation.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Base of the exponential backoff.
    #[must_use]
    pub const fn with_delay_base(mut self, delay_base: Duration) -> Self {
        self.delay_base = delay_base;
        self
    }

    /// Cap on a single inter-attempt delay.
    #[must_use]
    pub const fn with_max_backoff_delay(mut self, max_backoff_delay: Duration) -> Self {
        self.max_backoff_delay = max_backoff_delay;
        self
    }

    /// Wait this long between every attempt instead of backing off.
    #[must_use]
    pub const fn with_fixed_delay(mut self, fixed_delay: Duration) -> Self {
        self.fixed_delay = Some(fixed_delay);
        self
    }

    /// Stop retrying once this much time has passed since the first attempt.
    #[must_use]
    pub const fn with_max_to_last_call(mut self, limit: Duration) -> Self {
        self.max_to_last_call = Some(limit);
        self
    }

    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    #[must_use]
    pub const fn delay_base(&self) -> Duration {
        self.delay_base
    }

    #[must_use]
    pub const fn max_backoff_delay(&self) -> Duration {
        self.max_backoff_delay
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    ///
    /// Overflow of the exponential term clamps to the backoff cap.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if let Some(fixed) = self.fixed_delay {
            return fixed;
        }
        if self.delay_base.is_zero() {
            return Duration::ZERO;
        }
        1u32.checked_shl(attempt.saturating_sub(1))
            .and_then(|factor| self.delay_base.checked_mul(factor))
            .map_or(self.max_backoff_delay, |delay| delay.min(self.max_backoff_delay))
    }

    fn attempts_exhausted(&self, attempt: u32) -> bool {
        self.max_retries != 0 && attempt >= self.max_retries
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. Returns the last error in the latter cases.
///
/// `op` receives the 1-based attempt number.
///
/// # Errors
/// Returns the last error from `op`, or `E::from(Cancelled)` if `cancel`
/// fires during a backoff sleep.
pub async fn retry<T, E, F, Fut>(
    options: &RetryOptions,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, E>
where
    E: Retryable + From<Cancelled> + Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started = Instant::now();
    let mut attempt: u32 = 1;

    loop {
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() || options.attempts_exhausted(attempt) {
            return Err(err);
        }
        if options
            .max_to_last_call
            .is_some_and(|limit| started.elapsed() > limit)
        {
            return Err(err);
        }

        let delay = options.delay_for(attempt);
        tracing::debug!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Retrying after failed attempt"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(E::from(Cancelled)),
            () = sleep(delay) => {}
        }

        attempt = attempt.saturating_add(1);
    }
}
