//! Retry executor for registry writes
//!
//! The default policy is five attempts one second apart with no backoff or
//! jitter, and every error counts as retryable. Only the final failure is kept
//! in the returned error; each failed attempt is logged as it happens.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{RegistryError, Result};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Decides whether another attempt follows a failure
pub trait RetryStrategy: Send + Sync + fmt::Debug {
    /// Delay before the next attempt after `attempts` failed ones, or `None` to stop
    fn next_delay(&self, attempts: u32) -> Option<Duration>;
}

/// Constant delay, bounded attempt count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedRetry {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl FixedRetry {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts, delay }
    }
}

impl Default for FixedRetry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY)
    }
}

impl RetryStrategy for FixedRetry {
    fn next_delay(&self, attempts: u32) -> Option<Duration> {
        (attempts < self.max_attempts).then_some(self.delay)
    }
}

/// Runs an operation under a [`RetryStrategy`], honouring a cancellation token
#[derive(Debug, Clone)]
pub struct Retrier {
    strategy: Arc<dyn RetryStrategy>,
    cancel: CancellationToken,
}

impl Default for Retrier {
    fn default() -> Self {
        Self::new(FixedRetry::default())
    }
}

impl Retrier {
    pub fn new(strategy: impl RetryStrategy + 'static) -> Self {
        Self {
            strategy: Arc::new(strategy),
            cancel: CancellationToken::new(),
        }
    }

    /// Stop retrying once `cancel` fires; checked before every attempt and during sleeps
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn strategy(&self) -> &dyn RetryStrategy {
        self.strategy.as_ref()
    }

    /// Run `operation` until it succeeds, the strategy gives up, or the token is cancelled
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        let mut last: Option<RegistryError> = None;

        loop {
            if self.cancel.is_cancelled() {
                return Err(RegistryError::Cancelled {
                    attempts,
                    last: last.map(Box::new),
                });
            }

            attempts += 1;
            let err = match operation().await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(attempt = attempts, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let Some(delay) = self.strategy.next_delay(attempts) else {
                warn!(attempt = attempts, error = %err, "attempt failed, giving up");
                return Err(RegistryError::RetryExhausted {
                    attempts,
                    source: Box::new(err),
                });
            };
            warn!(attempt = attempts, error = %err, delay_ms = delay.as_millis() as u64, "attempt failed, retrying");
            last = Some(err);

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(RegistryError::Cancelled {
                        attempts,
                        last: last.map(Box::new),
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
