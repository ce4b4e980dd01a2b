//! Bounded retry with exponential backoff

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;
use view_core::config::RetryConfig;
use view_core::Error;

/// Successful outcome of a retried operation
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,

    /// Attempts used, the successful one included
    pub attempts: u32,
}

/// The retry budget ran out
#[derive(Debug)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: Error,
}

/// Retry policy: a fixed attempt budget with exponentially growing delays.
///
/// The delay after failed attempt `n` is
/// `min(max_delay, initial_delay * multiplier^(n-1)) * (1 + r)`, `r` drawn
/// uniformly from `[0, random_factor)`.
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    random_factor: f64,
}

impl From<&RetryConfig> for RetryStrategy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: config.initial_delay,
            max_delay: config.max_delay,
            multiplier: config.backoff_multiplier.max(1.0),
            random_factor: config.random_factor.max(0.0),
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl RetryStrategy {
    /// Deterministic backoff without jitter
    pub fn exponential(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
            multiplier: 2.0,
            random_factor: 0.0,
        }
    }

    pub fn with_random_factor(mut self, random_factor: f64) -> Self {
        self.random_factor = random_factor.max(0.0);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the attempt following failed attempt `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        let stretched = if self.random_factor > 0.0 {
            capped * (1.0 + rand::thread_rng().gen_range(0.0..self.random_factor))
        } else {
            capped
        };
        Duration::from_secs_f64(stretched)
    }

    /// Run `operation` until it succeeds or the attempt budget is spent.
    ///
    /// The closure receives the 1-based attempt number.
    pub async fn retry<T, F, Fut>(&self, name: &str, mut operation: F) -> Result<Retried<T>, RetryExhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = view_core::Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    return Ok(Retried {
                        value,
                        attempts: attempt,
                    })
                }
                Err(e) if attempt >= self.max_attempts => {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: e,
                    })
                }
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        operation = name,
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
