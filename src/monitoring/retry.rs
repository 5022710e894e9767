use crate::config::MonitoringConfig;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Attempt budget and delay schedule for reconnects
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff: f64,
}

impl RetryConfig {
    pub fn for_recovery(config: &MonitoringConfig) -> Self {
        Self {
            max_attempts: config.max_recovery_attempts,
            initial_delay: config.recovery_delay,
            max_delay: config.max_recovery_delay,
            backoff: config.recovery_backoff,
        }
    }

    /// Wait after the `attempt`-th failure (1-based): the initial delay grown
    /// by `backoff` per earlier failure, capped at `max_delay`
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `f` until it succeeds or attempts run out. `f` receives the
    /// 1-based attempt number.
    pub async fn execute<F, Fut, T, E>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match f(attempt).await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!("Reconnect succeeded on attempt {}", attempt);
                    }
                    return Ok(result);
                }
                Err(error) if attempt >= self.config.max_attempts => {
                    warn!("All {} reconnect attempts exhausted", self.config.max_attempts);
                    return Err(error);
                }
                Err(error) => {
                    let delay = self.config.delay_after(attempt);
                    warn!(
                        "Reconnect attempt {} failed: {}. Retrying in {:?}",
                        attempt, error, delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
