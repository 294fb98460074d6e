//! # Retry Executor
//!
//! Bounded retries with exponential backoff and optional jitter around any
//! fallible async operation.
//!
//! The delay before attempt `k` (`k >= 2`) is `base_delay * multiplier^(k-2)`,
//! capped at `max_delay`, so the first retry waits exactly `base_delay`. With
//! jitter enabled the capped delay is scaled by a uniform factor in `[0.5, 1.0]`.
//!
//! System failures (an open circuit, an exhausted bulkhead) are never retried
//! here, whatever the policy says. For other failures the policy's retryable
//! predicate decides when one is set, otherwise the error's [`Classify`] kind
//! does: only [`ErrorKind::Transient`] failures are retried.

use crate::constants::defaults;
use crate::error::ErrorKind;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Errors that know which failure class they belong to
pub trait Classify {
    fn kind(&self) -> ErrorKind;

    fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Custom retry decision over the failed operation's error
pub type RetryPredicate = Arc<dyn Fn(&(dyn StdError + 'static)) -> bool + Send + Sync>;

/// Immutable retry configuration attached to a call site
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_enabled: bool,
    /// Overrides the error's own classification when set
    pub retryable: Option<RetryPredicate>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter_enabled", &self.jitter_enabled)
            .field("retryable", &self.retryable.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::MAX_ATTEMPTS,
            base_delay: defaults::BASE_DELAY,
            max_delay: defaults::MAX_DELAY,
            backoff_multiplier: defaults::BACKOFF_MULTIPLIER,
            jitter_enabled: true,
            retryable: None,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_multiplier(mut self, backoff_multiplier: f64) -> Self {
        self.backoff_multiplier = backoff_multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter_enabled: bool) -> Self {
        self.jitter_enabled = jitter_enabled;
        self
    }

    pub fn with_retryable<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    {
        self.retryable = Some(Arc::new(predicate));
        self
    }

    /// Un-jittered delay before attempt `attempt` (1-based). Zero for the first attempt.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !secs.is_finite() || secs < 0.0 || secs > self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay before attempt `attempt` (1-based), jitter applied when enabled
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for_attempt(attempt);
        if self.jitter_enabled {
            delay.mul_f64(0.5 + fastrand::f64() * 0.5)
        } else {
            delay
        }
    }

    /// Redelivery delay after the `retry_count`-th failure of a queued message
    pub fn redelivery_delay(&self, retry_count: u32) -> Duration {
        self.delay_for_attempt(retry_count.saturating_add(1))
    }

    fn should_retry<E>(&self, error: &E) -> bool
    where
        E: Classify + StdError + 'static,
    {
        if error.kind() == ErrorKind::System {
            return false;
        }
        match &self.retryable {
            Some(predicate) => predicate(error as &(dyn StdError + 'static)),
            None => error.is_retryable(),
        }
    }
}

/// Terminal outcome of a retried operation
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error
    #[error("Operation failed after {total_attempts} attempts: {last_error}")]
    Exhausted { total_attempts: u32, last_error: E },

    /// A non-retryable error stopped the retries early
    #[error("Operation failed with non-retryable error on attempt {attempts}: {error}")]
    NonRetryable { attempts: u32, error: E },
}

impl<E> RetryError<E> {
    /// Number of attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { total_attempts, .. } => *total_attempts,
            Self::NonRetryable { attempts, .. } => *attempts,
        }
    }

    pub fn last_error(&self) -> &E {
        match self {
            Self::Exhausted { last_error, .. } => last_error,
            Self::NonRetryable { error, .. } => error,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last_error, .. } => last_error,
            Self::NonRetryable { error, .. } => error,
        }
    }
}

/// Runs operations under a [`RetryPolicy`]
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    component: String,
}

impl RetryExecutor {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    /// Attempt `operation` up to `policy.max_attempts` times.
    ///
    /// The operation receives the 1-based attempt number.
    pub async fn execute_with_retry<F, Fut, T, E>(
        &self,
        policy: &RetryPolicy,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + StdError + 'static,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            component = %self.component,
                            attempt = attempt,
                            "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if !policy.should_retry(&error) {
                        debug!(
                            component = %self.component,
                            attempt = attempt,
                            error = %error,
                            "Non-retryable failure, giving up"
                        );
                        return Err(RetryError::NonRetryable {
                            attempts: attempt,
                            error,
                        });
                    }

                    if attempt >= max_attempts {
                        warn!(
                            component = %self.component,
                            total_attempts = attempt,
                            error = %error,
                            "🔁 Retry attempts exhausted"
                        );
                        return Err(RetryError::Exhausted {
                            total_attempts: attempt,
                            last_error: error,
                        });
                    }

                    attempt += 1;
                    let delay = policy.delay_for_attempt(attempt);
                    debug!(
                        component = %self.component,
                        next_attempt = attempt,
                        max_attempts = max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "🔁 Retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
