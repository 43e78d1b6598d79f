use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use super::Operation;
use crate::Result;

/// Per-call state visible to middleware.
#[derive(Debug, Clone, PartialEq)]
pub struct CallContext {
    pub request_id: String,
    pub operation: Operation,
    /// Key used by the circuit breaker, usually the endpoint URL.
    pub endpoint: String,
    /// 1-based attempt number, maintained by the retry middleware.
    pub attempt: u32,
    pub metadata: Map<String, Value>,
}

impl CallContext {
    pub fn new(request_id: impl Into<String>, operation: Operation, endpoint: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            operation,
            endpoint: endpoint.into(),
            attempt: 1,
            metadata: Map::new(),
        }
    }
}

/// The operation at the bottom of a middleware chain.
pub type BoxCall<T> = dyn Fn(&CallContext) -> BoxFuture<'static, Result<T>> + Send + Sync;

/// Layer wrapped around an operation.
///
/// A middleware decides whether, when and how often the rest of the chain
/// runs by calling [`Next::run`] zero or more times.
#[async_trait]
pub trait Middleware<T>: Send + Sync {
    async fn handle(&self, ctx: &mut CallContext, next: Next<'_, T>) -> Result<T>;
}

struct Layer<T> {
    priority: i32,
    seq: u64,
    middleware: Arc<dyn Middleware<T>>,
}

impl<T> Clone for Layer<T> {
    fn clone(&self) -> Self {
        Self {
            priority: self.priority,
            seq: self.seq,
            middleware: self.middleware.clone(),
        }
    }
}

/// Continuation handed to a [`Middleware`].
pub struct Next<'a, T> {
    rest: &'a [Layer<T>],
    call: &'a BoxCall<T>,
}

impl<T> Clone for Next<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Next<'_, T> {}

impl<T: Send + 'static> Next<'_, T> {
    /// Runs the remaining layers and finally the operation itself.
    pub async fn run(self, ctx: &mut CallContext) -> Result<T> {
        match self.rest.split_first() {
            Some((layer, rest)) => {
                layer
                    .middleware
                    .handle(
                        ctx,
                        Next {
                            rest,
                            call: self.call,
                        },
                    )
                    .await
            }
            None => (self.call)(ctx).await,
        }
    }
}

/// Ordered stack of [`Middleware`]. Lower priority is the outer layer.
pub struct MiddlewareChain<T> {
    layers: ArcSwap<Vec<Layer<T>>>,
    writer: Mutex<()>,
    seq: AtomicU64,
}

impl<T> Default for MiddlewareChain<T> {
    fn default() -> Self {
        Self {
            layers: ArcSwap::from_pointee(Vec::new()),
            writer: Mutex::new(()),
            seq: AtomicU64::new(0),
        }
    }
}

impl<T: Send + 'static> MiddlewareChain<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, priority: i32, middleware: Arc<dyn Middleware<T>>) {
        let _guard = self.writer.lock();
        let mut next = (*self.layers.load_full()).clone();
        next.push(Layer {
            priority,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            middleware,
        });
        next.sort_by_key(|layer| (layer.priority, layer.seq));
        self.layers.store(Arc::new(next));
    }

    pub fn len(&self) -> usize {
        self.layers.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `call` wrapped by every layer.
    ///
    /// The layer list is snapshotted first, so a concurrent [`add`](Self::add)
    /// only affects later calls.
    pub async fn run<F>(&self, ctx: &mut CallContext, call: F) -> Result<T>
    where
        F: Fn(&CallContext) -> BoxFuture<'static, Result<T>> + Send + Sync + 'static,
    {
        let layers = self.layers.load_full();
        let next = Next {
            rest: &layers,
            call: &call,
        };
        next.run(ctx).await
    }
}

impl<T> std::fmt::Debug for MiddlewareChain<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("layers", &self.layers.load().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use futures::FutureExt;
    use serde_json::json;

    use super::*;
    use crate::Error;

    struct Tag(&'static str, Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl Middleware<Value> for Tag {
        async fn handle(&self, ctx: &mut CallContext, next: Next<'_, Value>) -> Result<Value> {
            self.1.lock().push(format!("{}>", self.0));
            let out = next.run(ctx).await;
            self.1.lock().push(format!("<{}", self.0));
            out
        }
    }

    struct Twice;

    #[async_trait]
    impl Middleware<Value> for Twice {
        async fn handle(&self, ctx: &mut CallContext, next: Next<'_, Value>) -> Result<Value> {
            if let Ok(value) = next.run(ctx).await {
                return Ok(value);
            }
            ctx.attempt += 1;
            next.run(ctx).await
        }
    }

    struct Deny;

    #[async_trait]
    impl Middleware<Value> for Deny {
        async fn handle(&self, ctx: &mut CallContext, _next: Next<'_, Value>) -> Result<Value> {
            Err(Error::CircuitOpen {
                endpoint: ctx.endpoint.clone(),
            })
        }
    }

    fn ctx() -> CallContext {
        CallContext::new("r1", Operation::Simulation, "http://rpc")
    }

    #[tokio::test]
    async fn test_layers_nest_by_priority() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::<Value>::new();
        chain.add(10, Arc::new(Tag("inner", log.clone())));
        chain.add(1, Arc::new(Tag("outer", log.clone())));

        let out = chain
            .run(&mut ctx(), |_| async { Ok(json!("done")) }.boxed())
            .await
            .unwrap();

        assert_eq!(out, json!("done"));
        assert_eq!(*log.lock(), ["outer>", "inner>", "<inner", "<outer"]);
    }

    #[tokio::test]
    async fn test_next_can_run_more_than_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let chain = MiddlewareChain::<Value>::new();
        chain.add(0, Arc::new(Twice));

        let counter = calls.clone();
        let mut cx = ctx();
        let out = chain
            .run(&mut cx, move |cx| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let attempt = cx.attempt;
                async move {
                    if n == 0 {
                        Err(Error::network("reset"))
                    } else {
                        Ok(json!(attempt))
                    }
                }
                .boxed()
            })
            .await
            .unwrap();

        assert_eq!(out, json!(2));
        assert_eq!(cx.attempt, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_call() {
        let called = Arc::new(AtomicU32::new(0));
        let chain = MiddlewareChain::<Value>::new();
        chain.add(0, Arc::new(Deny));

        let counter = called.clone();
        let err = chain
            .run(&mut ctx(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(Value::Null) }.boxed()
            })
            .await
            .unwrap_err();

        assert!(err.is_circuit_open());
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_chain_runs_call() {
        let chain = MiddlewareChain::<Value>::new();
        assert!(chain.is_empty());
        let out = chain
            .run(&mut ctx(), |cx| {
                let id = cx.request_id.clone();
                async move { Ok(json!(id)) }.boxed()
            })
            .await
            .unwrap();
        assert_eq!(out, json!("r1"));
    }
}
