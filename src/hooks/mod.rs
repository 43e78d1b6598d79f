//! Hook engine and middleware.
//!
//! Every SDK operation fires a fixed sequence of named extension points
//! ([`HookName`]). Plugins attach handlers to those points with a priority;
//! handlers run in ascending priority order, each receiving the
//! [`HookContext`] produced by the previous one. Any handler may set
//! [`HookContext::halt`] to stop the chain.
//!
//! Where a behaviour must *wrap* an operation rather than observe it (retry,
//! circuit breaking) use the [`MiddlewareChain`] instead, which composes
//! layers by continuation passing.
//!
//! # Example
//!
//! ```
//! use hypersim::hooks::{HookContext, HookEngine, HookName};
//! use serde_json::json;
//!
//! let engine = HookEngine::new();
//! engine
//!     .register("audit", HookName::BeforeSimulation, 10, |mut ctx: HookContext, payload: &serde_json::Value| {
//!         ctx.metadata.insert("seen".into(), payload.clone());
//!         Ok(ctx)
//!     })
//!     .unwrap();
//!
//! let ctx = engine.fire(
//!     HookName::BeforeSimulation,
//!     HookContext::new("req-1", json!({})),
//!     &json!({"from": "0xabc"}),
//! );
//! assert_eq!(ctx.metadata["seen"], json!({"from": "0xabc"}));
//! ```

mod engine;
mod middleware;

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use engine::{HookEngine, PluginInfo};
pub use middleware::{BoxCall, CallContext, Middleware, MiddlewareChain, Next};

/// Named extension point.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[serde(rename_all = "kebab-case")]
pub enum HookName {
    #[display("before-request")]
    BeforeRequest,
    #[display("after-response")]
    AfterResponse,
    #[display("before-simulation")]
    BeforeSimulation,
    #[display("after-simulation")]
    AfterSimulation,
    /// Reserved for callers wrapping an external risk-analysis service.
    /// Nothing in this crate fires the `*-ai-analysis` pair.
    #[display("before-ai-analysis")]
    BeforeAiAnalysis,
    #[display("after-ai-analysis")]
    AfterAiAnalysis,
    #[display("on-error")]
    OnError,
    #[display("on-connect")]
    OnConnect,
    #[display("on-disconnect")]
    OnDisconnect,
    /// Fired by applications, never by the clients.
    #[display("on-startup")]
    OnStartup,
    #[display("on-shutdown")]
    OnShutdown,
}

/// Operation families that fire a `before-*`/`after-*` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    #[display("request")]
    Request,
    #[display("simulation")]
    Simulation,
    /// Calls to an external analysis service, see [`HookName::BeforeAiAnalysis`].
    #[display("ai-analysis")]
    AiAnalysis,
}

impl Operation {
    /// Hook fired before the network call.
    #[must_use]
    pub const fn before(self) -> HookName {
        match self {
            Self::Request => HookName::BeforeRequest,
            Self::Simulation => HookName::BeforeSimulation,
            Self::AiAnalysis => HookName::BeforeAiAnalysis,
        }
    }

    /// Hook fired after a successful network call.
    #[must_use]
    pub const fn after(self) -> HookName {
        match self {
            Self::Request => HookName::AfterResponse,
            Self::Simulation => HookName::AfterSimulation,
            Self::AiAnalysis => HookName::AfterAiAnalysis,
        }
    }
}

/// Value threaded through one firing chain.
///
/// `metadata` is scratch space shared by the handlers of a chain. Built-in
/// plugins use it to cooperate, e.g. the metrics plugin stores the start time
/// in `before-*` and reads it back in `after-*`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookContext {
    pub request_id: String,
    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub payload: Value,
    /// Stops the remaining handlers of the current chain.
    pub halt: bool,
    /// Replacement value proposed by a handler.
    ///
    /// After a `before-*` chain that halted, the patch is used as the
    /// operation result. After an `after-*` chain it replaces the response.
    pub patch: Option<Value>,
    pub metadata: Map<String, Value>,
}

impl HookContext {
    pub fn new(request_id: impl Into<String>, payload: Value) -> Self {
        Self {
            request_id: request_id.into(),
            timestamp: Utc::now().timestamp_millis(),
            payload,
            halt: false,
            patch: None,
            metadata: Map::new(),
        }
    }

    /// Halts the chain and proposes `value` as the result.
    #[must_use]
    pub fn halt_with(mut self, value: Value) -> Self {
        self.halt = true;
        self.patch = Some(value);
        self
    }

    #[inline]
    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    #[inline]
    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }
}

/// Hook handler.
///
/// Returning an error is treated as a no-op: the context the handler received
/// is discarded and the previous one is passed on to the next handler.
pub trait Handler: Send + Sync {
    fn call(&self, ctx: HookContext, payload: &Value) -> anyhow::Result<HookContext>;
}

impl<F> Handler for F
where
    F: Fn(HookContext, &Value) -> anyhow::Result<HookContext> + Send + Sync,
{
    #[inline]
    fn call(&self, ctx: HookContext, payload: &Value) -> anyhow::Result<HookContext> {
        self(ctx, payload)
    }
}

/// A handler bound to a hook name and priority, as declared by a [`Plugin`].
#[derive(Clone)]
pub struct Hook {
    pub name: HookName,
    /// Lower runs first.
    pub priority: i32,
    pub handler: Arc<dyn Handler>,
}

impl Hook {
    pub fn new<F>(name: HookName, priority: i32, handler: F) -> Self
    where
        F: Fn(HookContext, &Value) -> anyhow::Result<HookContext> + Send + Sync + 'static,
    {
        Self {
            name,
            priority,
            handler: Arc::new(handler),
        }
    }

    pub fn from_handler(name: HookName, priority: i32, handler: Arc<dyn Handler>) -> Self {
        Self {
            name,
            priority,
            handler,
        }
    }
}

impl std::fmt::Debug for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hook")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// SDK plugin.
///
/// A plugin declares its handlers through [`Plugin::hooks`]; the engine
/// registers all of them atomically. The lifecycle methods default to no-ops.
///
/// ```
/// use std::sync::Arc;
/// use hypersim::hooks::{Hook, HookEngine, HookName, Plugin};
///
/// struct Tagger;
///
/// impl Plugin for Tagger {
///     fn id(&self) -> &str {
///         "tagger"
///     }
///
///     fn hooks(self: Arc<Self>) -> Vec<Hook> {
///         vec![Hook::new(HookName::BeforeRequest, 0, |mut ctx, _| {
///             ctx.set_meta("tagged", true);
///             Ok(ctx)
///         })]
///     }
/// }
///
/// let engine = HookEngine::new();
/// engine.register_plugin(Arc::new(Tagger)).unwrap();
/// assert_eq!(engine.handler_count(HookName::BeforeRequest), 1);
/// ```
pub trait Plugin: Send + Sync {
    fn id(&self) -> &str;

    fn hooks(self: Arc<Self>) -> Vec<Hook>;

    /// Called once after the plugin's hooks are installed. An error rolls the
    /// registration back.
    fn on_register(&self, _engine: &HookEngine) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once after the plugin's hooks are removed.
    fn on_unregister(&self) {}

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_hook_name_wire_format() {
        assert_eq!(HookName::OnError.to_string(), "on-error");
        assert_eq!(
            serde_json::to_value(HookName::BeforeAiAnalysis).unwrap(),
            json!("before-ai-analysis")
        );
        let name: HookName = serde_json::from_value(json!("after-simulation")).unwrap();
        assert_eq!(name, HookName::AfterSimulation);
    }

    #[test]
    fn test_operation_hook_pairs() {
        assert_eq!(Operation::Simulation.before(), HookName::BeforeSimulation);
        assert_eq!(Operation::Simulation.after(), HookName::AfterSimulation);
        assert_eq!(Operation::Request.after(), HookName::AfterResponse);
        assert_eq!(Operation::AiAnalysis.before(), HookName::BeforeAiAnalysis);
    }

    #[test]
    fn test_halt_with() {
        let ctx = HookContext::new("r", Value::Null).halt_with(json!(42));
        assert!(ctx.halt);
        assert_eq!(ctx.patch, Some(json!(42)));
    }
}
