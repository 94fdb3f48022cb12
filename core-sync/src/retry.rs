//! # Retry Policy
//!
//! One backoff implementation shared by every remote call site.
//!
//! ## Overview
//!
//! [`RetryPolicy::run`] wraps any fallible async operation and retries it while
//! a caller-supplied predicate says the error is retryable. The exponential
//! schedule (`base_delay * 2^(attempt-1)`, capped at `max_delay`) comes from a
//! `backon` [`ExponentialBuilder`]; each retry is additionally staggered by a
//! random offset in `[0, base_delay)` so workers that failed together do not
//! retry together. Non-retryable errors come back immediately as
//! [`RetryError::Permanent`]; running out of attempts yields
//! [`RetryError::Exhausted`] carrying the last underlying error.
//!
//! ## Usage
//!
//! ```ignore
//! use core_sync::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(4, Duration::from_secs(1));
//! let stat = policy.call(|| store.stat("db/archive.sqlite")).await?;
//! ```

use backon::{ExponentialBuilder, Retryable};
use bridge_traits::error::BridgeError;
use core_runtime::config::RetrySettings;
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Outcome of a call that did not succeed.
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// The predicate rejected the error; no further attempts were made
    #[error("{0}")]
    Permanent(E),

    /// Every allowed attempt failed
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    /// The underlying error, whichever way the call gave up.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Permanent(e) => e,
            RetryError::Exhausted { last, .. } => last,
        }
    }

    pub fn inner(&self) -> &E {
        match self {
            RetryError::Permanent(e) => e,
            RetryError::Exhausted { last, .. } => last,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

/// Exponential backoff with jitter and a bounded attempt count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(4, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    /// `max_attempts` counts the first call; values below 1 are raised to 1.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(300),
            jitter: true,
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(settings.max_attempts, settings.base_delay).with_max_delay(settings.max_delay)
    }

    /// Cap on the exponential part of the delay.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Disable jitter so delays are exactly `base_delay * 2^(attempt-1)`.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Exponential schedule between attempts, without jitter.
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay.max(self.base_delay))
            .with_factor(2.0)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
    }

    /// Random offset in `[0, base_delay)` added before each retry.
    pub fn jitter(&self) -> Duration {
        let base_nanos = u64::try_from(self.base_delay.as_nanos()).unwrap_or(u64::MAX);
        if !self.jitter || base_nanos == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::thread_rng().gen_range(0..base_nanos))
    }

    /// Run `operation`, retrying while `is_retryable` accepts the error.
    ///
    /// The operation is invoked at most `max_attempts` times.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        mut operation: F,
        is_retryable: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let attempt = AtomicU32::new(0);

        let attempt_op = || {
            let current = attempt.fetch_add(1, Ordering::SeqCst) + 1;
            let stagger = if current > 1 { self.jitter() } else { Duration::ZERO };
            let call = operation();
            async move {
                if !stagger.is_zero() {
                    tokio::time::sleep(stagger).await;
                }
                call.await
            }
        };

        let result = attempt_op
            .retry(self.backoff())
            .when(|e| is_retryable(e))
            .notify(|err, delay| {
                warn!(
                    attempt = attempt.load(Ordering::SeqCst),
                    max_attempts = self.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retryable failure, backing off"
                );
            })
            .await;

        let attempts = attempt.load(Ordering::SeqCst);
        match result {
            Ok(value) => {
                if attempts > 1 {
                    debug!(attempt = attempts, "Operation succeeded after retry");
                }
                Ok(value)
            }
            Err(error) if !is_retryable(&error) => {
                debug!(attempt = attempts, error = %error, "Non-retryable failure");
                Err(RetryError::Permanent(error))
            }
            Err(error) => {
                warn!(attempts, error = %error, "Retries exhausted");
                Err(RetryError::Exhausted {
                    attempts,
                    last: error,
                })
            }
        }
    }

    /// [`run`](Self::run) with [`BridgeError::is_retryable`] as the predicate.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, RetryError<BridgeError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BridgeError>>,
    {
        self.run(operation, BridgeError::is_retryable).await
    }
}
