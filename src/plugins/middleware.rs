use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use async_trait::async_trait;

use crate::{
    Error, Result,
    hooks::{CallContext, Middleware, Next},
    resilience::{CircuitBreaker, Retry, RetryConfig},
};

/// Re-runs the rest of the chain while it fails with a retryable error.
///
/// Each attempt sees a copy of the context with `attempt` set; metadata
/// written by inner layers during a failed attempt is discarded. On return
/// `ctx.attempt` holds the number of the last attempt made.
#[derive(Debug, Clone, Default)]
pub struct RetryMiddleware {
    retry: Retry,
}

impl RetryMiddleware {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            retry: Retry::new(config),
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Middleware<T> for RetryMiddleware {
    async fn handle(&self, ctx: &mut CallContext, next: Next<'_, T>) -> Result<T> {
        let last = AtomicU32::new(ctx.attempt);
        let base = &*ctx;
        let out = self
            .retry
            .run(Error::is_retryable, |attempt| {
                let mut attempt_ctx = base.clone();
                attempt_ctx.attempt = attempt;
                last.store(attempt, Ordering::Relaxed);
                async move { next.run(&mut attempt_ctx).await }
            })
            .await;
        ctx.attempt = last.load(Ordering::Relaxed);
        out
    }
}

/// Guards the rest of the chain with the circuit of `ctx.endpoint`.
#[derive(Debug, Clone, Default)]
pub struct BreakerMiddleware {
    breaker: Arc<CircuitBreaker>,
}

impl BreakerMiddleware {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

#[async_trait]
impl<T: Send + 'static> Middleware<T> for BreakerMiddleware {
    async fn handle(&self, ctx: &mut CallContext, next: Next<'_, T>) -> Result<T> {
        let permit = self.breaker.acquire(&ctx.endpoint)?;
        let out = next.run(ctx).await;
        match &out {
            Err(err) if err.is_retryable() => permit.failure(),
            _ => permit.success(),
        }
        out
    }
}
