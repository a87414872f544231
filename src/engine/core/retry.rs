use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::types::EngineError;

/// Fixed-delay retry with a ceiling, applied to transient failures only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `attempt` until it succeeds, fails permanently, or the ceiling is hit.
    ///
    /// `attempt` receives the number of retries made so far.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T, EngineError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut retries = 0;
        loop {
            match attempt(retries).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    retries += 1;
                    if retries > self.max_retries {
                        warn!(operation, attempts = retries, "Giving up after repeated failures");
                        return Err(EngineError::Abandoned {
                            operation,
                            attempts: retries,
                        });
                    }
                    debug!(operation, retry = retries, error = %err, "Retrying after delay");
                    sleep(self.delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransportFailure;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let started = tokio::time::Instant::now();

        let value = policy
            .run("test", move |_| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(EngineError::Transport(TransportFailure::Failed))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn abandons_after_ceiling() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(10, Duration::from_millis(1000));

        let err = policy
            .run("submit", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(EngineError::Transport(TransportFailure::TimedOut))
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::Abandoned {
                operation: "submit",
                attempts: 11
            }
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(5, Duration::from_secs(60));
        let err = policy
            .run("fetch", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(EngineError::Protocol("bad".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
