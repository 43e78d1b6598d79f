//! JSON-RPC client for the simulation endpoint.
//!
//! Every call runs through the same pipeline:
//!
//! 1. `before-*` hooks. A handler that halts with a patch (e.g. a cache hit)
//!    ends the call here and the patch is returned. A patch without halt
//!    replaces the request params.
//! 2. The client's [`MiddlewareChain`].
//! 3. [`Resilience`]: retry with backoff, each attempt behind the endpoint's
//!    circuit breaker.
//! 4. The HTTP POST.
//! 5. `after-*` hooks on success, where a patch replaces the response, or
//!    `on-error` hooks on failure with a `{kind, message, method}` payload.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hypersim::{Address, hooks::HookEngine, plugins::MetricsPlugin, types::TransactionRequest};
//!
//! # async fn example() -> hypersim::Result<()> {
//! let metrics = Arc::new(MetricsPlugin::new());
//! let hooks = Arc::new(HookEngine::new());
//! hooks.register_plugin(metrics.clone())?;
//!
//! let client = hypersim::mainnet().with_hooks(hooks);
//! let tx = TransactionRequest::new(Address::ZERO).to(Address::repeat_byte(1));
//! let result = client.simulate(&tx).await?;
//! println!("success={} gas={}", result.success, result.gas_used);
//! println!("{:?}", metrics.snapshot());
//! # Ok(())
//! # }
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::FutureExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use url::Url;

use crate::{
    Error, Result,
    config::Config,
    hooks::{CallContext, HookContext, HookEngine, HookName, Middleware, MiddlewareChain, Operation},
    resilience::Resilience,
    types::{NetworkStatus, SimulationResult, TransactionRequest},
};

pub const SIMULATE: &str = "hyperevm_simulate";
pub const NETWORK_STATUS: &str = "eth_getNetworkStatus";

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Simulation RPC client.
///
/// Cheap to share behind an `Arc`; the hook engine, middleware chain and
/// circuit breaker can be shared with other clients.
pub struct Client {
    http: reqwest::Client,
    timeout: Duration,
    url: Url,
    hooks: Arc<HookEngine>,
    middleware: Arc<MiddlewareChain<Value>>,
    resilience: Resilience,
    next_id: AtomicU64,
}

impl Client {
    /// Client for `url` with default settings.
    pub fn new(url: Url) -> Self {
        let config = Config {
            rpc_url: Some(url),
            ..Config::default()
        };
        Self::from_config(&config)
    }

    /// Client built from a [`Config`]; the config is assumed to be validated.
    pub fn from_config(config: &Config) -> Self {
        Self {
            http: http_client(config.request_timeout),
            timeout: config.request_timeout,
            url: config.rpc_url(),
            hooks: Arc::new(HookEngine::new()),
            middleware: Arc::new(MiddlewareChain::new()),
            resilience: Resilience::new(config.retry.clone(), config.breaker.clone()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_url(self, url: Url) -> Self {
        Self { url, ..self }
    }

    pub fn with_hooks(self, hooks: Arc<HookEngine>) -> Self {
        Self { hooks, ..self }
    }

    pub fn with_resilience(self, resilience: Resilience) -> Self {
        Self { resilience, ..self }
    }

    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[inline]
    pub fn hooks(&self) -> &Arc<HookEngine> {
        &self.hooks
    }

    #[inline]
    pub fn resilience(&self) -> &Resilience {
        &self.resilience
    }

    /// Adds a middleware layer. Lower priority is the outer layer.
    pub fn use_middleware(&self, priority: i32, middleware: Arc<dyn Middleware<Value>>) {
        self.middleware.add(priority, middleware);
    }

    /// Simulates `tx` with `hyperevm_simulate`.
    pub async fn simulate(&self, tx: &TransactionRequest) -> Result<SimulationResult> {
        tx.validate()?;
        let params = json!([tx]);
        let value = self.call(Operation::Simulation, SIMULATE, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Fetches the node status with `eth_getNetworkStatus`.
    pub async fn network_status(&self) -> Result<NetworkStatus> {
        let value = self
            .call(Operation::Request, NETWORK_STATUS, json!([]))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Sends an arbitrary JSON-RPC request and returns its `result`.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        self.call(Operation::Request, method, params).await
    }

    async fn call(&self, op: Operation, method: &str, mut params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request_id = format!("req_{id}");

        let payload = json!({ "method": method, "params": params });
        let mut ctx = self.hooks.fire(
            op.before(),
            HookContext::new(request_id.clone(), payload.clone()),
            &payload,
        );
        if let Some(patch) = ctx.patch.take() {
            if ctx.halt {
                log::debug!("[{request_id}] {method} answered by {} hooks", op.before());
                return Ok(patch);
            }
            params = patch;
        }

        let body = serde_json::to_vec(&RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params: &params,
        })?;

        let mut call_ctx = CallContext::new(request_id.clone(), op, self.url.as_str());
        let http = self.http.clone();
        let timeout = self.timeout;
        let url = self.url.clone();
        let resilience = self.resilience.clone();
        let out = self
            .middleware
            .run(&mut call_ctx, move |_| {
                let http = http.clone();
                let url = url.clone();
                let body = body.clone();
                let resilience = resilience.clone();
                async move {
                    let key = url.to_string();
                    resilience
                        .execute(&key, |_| post(&http, timeout, &url, body.clone()))
                        .await
                }
                .boxed()
            })
            .await;

        match out {
            Ok(value) => {
                ctx.payload = value.clone();
                let ctx = self.hooks.fire(op.after(), ctx, &value);
                Ok(ctx.patch.unwrap_or(value))
            }
            Err(err) => {
                log::debug!("[{request_id}] {method} failed: {err}");
                let info = json!({
                    "kind": err.kind(),
                    "message": err.to_string(),
                    "method": method,
                });
                ctx.payload = info.clone();
                self.hooks.fire(HookName::OnError, ctx, &info);
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.url.as_str())
            .field("middleware", &self.middleware)
            .finish_non_exhaustive()
    }
}

/// Maps a transport error, reporting timeouts with the configured limit.
fn request_error(err: reqwest::Error, timeout: Duration) -> Error {
    if err.is_timeout() {
        Error::timeout(timeout)
    } else if err.is_decode() {
        Error::serialization(err.to_string())
    } else {
        Error::network(err.to_string())
    }
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .tcp_nodelay(true)
        .build()
        .unwrap_or_else(|err| {
            log::warn!("falling back to default http client: {err:?}");
            reqwest::Client::new()
        })
}

async fn post(http: &reqwest::Client, timeout: Duration, url: &Url, body: Vec<u8>) -> Result<Value> {
    let res = http
        .post(url.clone())
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await
        .map_err(|err| request_error(err, timeout))?;

    let status = res.status();
    if !status.is_success() {
        let text = res.text().await.unwrap_or_default();
        return Err(status_error(status, text));
    }

    let res: RpcResponse = res.json().await.map_err(|err| request_error(err, timeout))?;
    match res {
        RpcResponse {
            error: Some(err), ..
        } => Err(Error::Rpc {
            code: err.code,
            message: err.message,
        }),
        RpcResponse { result, .. } => Ok(result.unwrap_or(Value::Null)),
    }
}

/// 5xx, 408 and 429 are transient; other 4xx are the caller's fault.
fn status_error(status: StatusCode, body: String) -> Error {
    let message = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Authentication { message },
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => Error::network(message),
        status if status.is_server_error() => Error::network(message),
        _ => Error::validation(message),
    }
}
