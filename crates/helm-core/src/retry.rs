use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;

/// Capped exponential backoff with full jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

/// How a retried operation ended.
#[derive(Debug, PartialEq)]
pub enum RetryOutcome<T, E> {
    Done(T),
    /// A non-retryable error, returned on first sight.
    Failed(E),
    /// The last retryable error once `max_attempts` were spent.
    Exhausted { attempts: u32, last: E },
    Cancelled,
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Upper bound of the delay before retry number `attempt` (1-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        if ceiling.is_zero() {
            return ceiling;
        }
        let millis = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
        Duration::from_millis(millis)
    }

    /// Run `op` until it succeeds, fails with an error `retryable` rejects,
    /// runs out of attempts, or `cancel` fires during a backoff sleep.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        retryable: impl Fn(&E) -> bool,
        mut op: F,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return RetryOutcome::Cancelled;
            }
            let error = match op(attempt).await {
                Ok(value) => return RetryOutcome::Done(value),
                Err(error) => error,
            };
            if !retryable(&error) {
                return RetryOutcome::Failed(error);
            }
            if attempt >= self.max_attempts {
                return RetryOutcome::Exhausted {
                    attempts: attempt,
                    last: error,
                };
            }
            tokio::select! {
                () = cancel.cancelled() => return RetryOutcome::Cancelled,
                () = tokio::time::sleep(self.delay(attempt)) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn ceiling_doubles_until_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
        };
        assert_eq!(policy.ceiling(1), Duration::from_millis(100));
        assert_eq!(policy.ceiling(2), Duration::from_millis(200));
        assert_eq!(policy.ceiling(4), Duration::from_millis(800));
        assert_eq!(policy.ceiling(5), Duration::from_millis(1_000));
        assert_eq!(policy.ceiling(64), Duration::from_millis(1_000));
        assert!(policy.delay(3) <= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let outcome = fast()
            .run(&CancellationToken::new(), |_: &&str| true, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { if attempt < 3 { Err("busy") } else { Ok(attempt) } }
            })
            .await;
        assert_eq!(outcome, RetryOutcome::Done(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_on_permanent_error_and_after_cap() {
        let outcome: RetryOutcome<(), &str> = fast()
            .run(&CancellationToken::new(), |e: &&str| *e == "busy", |_| async {
                Err("broken")
            })
            .await;
        assert_eq!(outcome, RetryOutcome::Failed("broken"));

        let outcome: RetryOutcome<(), &str> = fast()
            .run(&CancellationToken::new(), |_| true, |_| async { Err("busy") })
            .await;
        assert_eq!(
            outcome,
            RetryOutcome::Exhausted {
                attempts: 3,
                last: "busy"
            }
        );
    }

    #[tokio::test]
    async fn cancellation_ends_the_loop() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome: RetryOutcome<(), &str> =
            fast().run(&cancel, |_| true, |_| async { Err("busy") }).await;
        assert_eq!(outcome, RetryOutcome::Cancelled);
    }
}
