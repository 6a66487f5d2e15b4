use std::time::Duration;

use rand::Rng;
use tracing::warn;

use trail_core::config::FollowerConfig;
use trail_core::wire::ShipRecord;
use trail_core::DeliveryError;

use crate::sink::{DeliveryReceipt, Sink};

/// Bounded exponential backoff with jitter for one batch.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
        }
    }
}

/// Why a batch was given up on.
#[derive(Clone, Debug)]
pub struct RetryOutcome {
    pub error: DeliveryError,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &FollowerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based). A server hint wins.
    pub fn delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay.min(self.max_delay);
        }
        let exp = self.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt.min(30) as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        let spread = capped * self.jitter_factor;
        let jitter = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    /// Deliver `records`, retrying retryable failures. Fatal errors stop at
    /// once; so does running out of attempts.
    pub async fn deliver(&self, sink: &dyn Sink, records: &[ShipRecord]) -> Result<DeliveryReceipt, RetryOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match sink.deliver(records).await {
                Ok(receipt) => return Ok(receipt),
                Err(error) => {
                    if !error.is_retryable() || attempt >= self.max_attempts {
                        return Err(RetryOutcome {
                            error,
                            attempts: attempt,
                        });
                    }
                    let delay = self.delay(attempt - 1, error.suggested_delay());
                    warn!(
                        sink = sink.name(),
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying delivery"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
