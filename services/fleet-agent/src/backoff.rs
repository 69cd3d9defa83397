//! Exponential backoff for retrying platform connections.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (starting at 0), before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay before retry number `attempt`, with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt).as_secs_f64();
        let range = delay * self.jitter.clamp(0.0, 1.0);
        let jitter = if range > 0.0 {
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };
        Duration::from_secs_f64((delay + jitter).max(0.0))
    }
}

/// Retry `op` until it succeeds or `cancel` fires.
///
/// Returns `None` if cancelled before a success.
pub async fn retry_until<T, E, F, Fut>(
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = op() => result,
        };

        match result {
            Ok(value) => return Some(value),
            Err(e) => {
                let delay = policy.delay(attempt);
                warn!(
                    what,
                    attempt = attempt + 1,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );
                attempt = attempt.saturating_add(1);

                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_base_delay_doubles_and_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_delay(0), Duration::from_millis(500));
        assert_eq!(policy.base_delay(1), Duration::from_secs(1));
        assert_eq!(policy.base_delay(3), Duration::from_secs(4));
        assert_eq!(policy.base_delay(10), Duration::from_secs(30));
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = BackoffPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay(2);
            assert!(delay >= Duration::from_millis(1500));
            assert!(delay <= Duration::from_millis(2500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let policy = BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::default()
        };

        let result = retry_until(&policy, &CancellationToken::new(), "ping", || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("refused")
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result, Some(7));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Option<()> = retry_until(&BackoffPolicy::default(), &cancel, "ping", || async {
            Err::<(), _>("refused")
        })
        .await;
        assert_eq!(result, None);
    }
}
