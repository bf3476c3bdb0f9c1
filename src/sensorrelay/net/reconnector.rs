use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use tokio::time::sleep;

use crate::error::{ErrorCode, RelayError};
use crate::sensorrelay::config::RetryConfig;

/// Bounded retry with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the given (1-based) failed attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }

    /// Runs `op` until it succeeds or the attempts are used up, sleeping
    /// between failures. The attempt number (1-based) is passed to `op`.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, RelayError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, RelayError>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", what, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if attempt >= self.max_attempts => {
                    return Err(RelayError::new(
                        ErrorCode::RetriesExhausted,
                        format!("{} failed after {} attempts: {}", what, attempt, e),
                    ));
                }
                Err(e) => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}, retrying in {:?}",
                        what, attempt, self.max_attempts, e, delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}
