//! Host-side re-delivery of failed flushes.
//!
//! The delivery client only classifies failures. Hosts that want to act on a
//! retryable failure resend the whole batch with exponential backoff.

use std::time::Duration;

use tracing::{error, info, warn};

use crate::buffer::PendingFlush;
use crate::client::FlushResult;

/// Default base delay for exponential backoff (in milliseconds).
const DEFAULT_BASE_DELAY_MS: u64 = 500;

/// Maximum delay between retries (in milliseconds).
const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// How often and how patiently a flush is resent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Resends after the first attempt
    pub max_retries: u32,

    pub base_delay: Duration,

    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(MAX_RETRY_DELAY_MS),
        }
    }

    /// Calculate the backoff delay for a given retry attempt.
    ///
    /// Uses exponential backoff with jitter:
    /// delay = min(base_delay * 2^attempt + jitter, max_delay)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_delay = self.base_delay.as_millis() as u64;

        // base * 2^attempt
        let exponential_delay = base_delay.saturating_mul(1 << attempt.min(10));

        // Up to 25% jitter
        let jitter = rand::random::<u64>() % (exponential_delay / 4 + 1);

        let max_delay = self.max_delay.as_millis() as u64;
        Duration::from_millis(exponential_delay.saturating_add(jitter).min(max_delay))
    }
}

/// Deliver a flush, resending the whole batch on retryable failures.
///
/// Terminal failures are returned immediately. After `max_retries` resends the
/// last retryable failure is returned.
pub async fn deliver_with_retry(flush: &PendingFlush, policy: &RetryPolicy) -> FlushResult {
    let mut attempt = 0;

    loop {
        if attempt > 0 {
            let delay = policy.backoff_delay(attempt - 1);
            warn!(
                flush_id = %flush.id(),
                attempt = attempt,
                max_retries = policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Retrying flush after failure"
            );
            tokio::time::sleep(delay).await;
        }

        match flush.deliver().await {
            Ok(report) => {
                info!(
                    flush_id = %flush.id(),
                    records = report.records,
                    payloads = report.payloads,
                    attempts = attempt + 1,
                    "Successfully delivered batch"
                );
                return Ok(report);
            }
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
            }
            Err(e) => {
                error!(
                    flush_id = %flush.id(),
                    error = %e,
                    records = flush.len(),
                    attempts = attempt + 1,
                    retryable = e.is_retryable(),
                    "Giving up on batch"
                );
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay_increases() {
        let policy = RetryPolicy::default();

        let delay1 = policy.backoff_delay(0);
        let delay2 = policy.backoff_delay(1);
        let delay3 = policy.backoff_delay(2);

        // 500ms plus up to 25% jitter
        assert!(delay1.as_millis() >= 500);
        assert!(delay1.as_millis() <= 625);

        assert!(delay2.as_millis() >= 1000);
        assert!(delay2.as_millis() <= 1250);

        assert!(delay3.as_millis() >= 2000);
        assert!(delay3.as_millis() <= 2500);
    }

    #[test]
    fn test_backoff_delay_caps_at_max() {
        let policy = RetryPolicy::default();
        let delay = policy.backoff_delay(20);
        assert_eq!(delay, Duration::from_millis(MAX_RETRY_DELAY_MS));
    }

    #[test]
    fn test_custom_delays() {
        let policy = RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(15),
        };
        assert!(policy.backoff_delay(0) <= Duration::from_millis(12));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(15));
    }
}
