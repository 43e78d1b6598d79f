//! Retry and circuit breaking.
//!
//! [`Retry`] re-runs a fallible operation with exponential backoff;
//! [`CircuitBreaker`] stops calling an endpoint that keeps failing.
//! [`Resilience`] stacks the two: every attempt made by the retry loop goes
//! through the breaker, so an open circuit ends the loop immediately with
//! [`Error::CircuitOpen`](crate::Error::CircuitOpen).

mod breaker;
mod retry;

use std::{future::Future, sync::Arc};

pub use breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitState, Permit};
pub use retry::{Retry, RetryConfig};

use crate::{Error, Result};

/// Retry on top of a shared circuit breaker.
#[derive(Debug, Clone, Default)]
pub struct Resilience {
    retry: Retry,
    breaker: Arc<CircuitBreaker>,
}

impl Resilience {
    pub fn new(retry: RetryConfig, breaker: BreakerConfig) -> Self {
        Self {
            retry: Retry::new(retry),
            breaker: Arc::new(CircuitBreaker::new(breaker)),
        }
    }

    /// Uses an existing breaker, e.g. one shared with other clients.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    #[inline]
    pub fn retry(&self) -> &Retry {
        &self.retry
    }

    #[inline]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Runs `op` against `key` with retry and circuit breaking.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn execute<T, F, Fut>(&self, key: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = &self.breaker;
        self.retry
            .run(Error::is_retryable, |attempt| {
                let fut = op(attempt);
                breaker.call(key, move || fut)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    use super::*;

    fn resilience() -> Resilience {
        Resilience::new(
            RetryConfig {
                max_attempts: 5,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                multiplier: 2.0,
                jitter: 0.0,
            },
            BreakerConfig {
                failure_threshold: 3,
                minimum_requests: 3,
                cooldown: Duration::from_secs(30),
                window: Duration::from_secs(60),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_stops_retry_loop() {
        let resilience = resilience();
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let err = resilience
            .execute("rpc", move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::network("refused"))
            })
            .await
            .unwrap_err();

        // the third failure trips the breaker, the fourth attempt is refused locally
        assert!(err.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(resilience.breaker().state("rpc"), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_within_budget() {
        let resilience = resilience();
        let out = resilience
            .execute("rpc", |attempt| async move {
                if attempt == 1 {
                    Err(Error::timeout(Duration::from_secs(1)))
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(out, Ok(2));
        assert_eq!(resilience.breaker().snapshot()["rpc"].failure_count, 1);
    }
}
