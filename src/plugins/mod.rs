//! Built-in plugins and middleware.
//!
//! | Type | Kind | Hooks |
//! |------|------|-------|
//! | [`LoggingPlugin`] | plugin | every `before-*`, `after-*`, `on-error`, `on-connect`, `on-disconnect` |
//! | [`MetricsPlugin`] | plugin | every `before-*`, `after-*`, `on-error` |
//! | [`CachingPlugin`] | plugin | `before-simulation`, `after-simulation` |
//! | [`RetryMiddleware`] | middleware | wraps the call |
//! | [`BreakerMiddleware`] | middleware | wraps the call |

mod caching;
mod metrics;
mod middleware;

use std::sync::Arc;

use serde_json::Value;

pub use caching::CachingPlugin;
pub use metrics::{MetricsPlugin, MetricsSnapshot};
pub use middleware::{BreakerMiddleware, RetryMiddleware};

use crate::hooks::{Hook, HookContext, HookName, Plugin};

const LOGGED_HOOKS: [HookName; 9] = [
    HookName::BeforeRequest,
    HookName::AfterResponse,
    HookName::BeforeSimulation,
    HookName::AfterSimulation,
    HookName::BeforeAiAnalysis,
    HookName::AfterAiAnalysis,
    HookName::OnError,
    HookName::OnConnect,
    HookName::OnDisconnect,
];

/// Logs every firing through the [`log`] facade.
///
/// `on-error` is always logged at `warn`, everything else at the configured
/// level. The plugin never modifies the context.
#[derive(Debug, Clone)]
pub struct LoggingPlugin {
    level: log::Level,
    include_payload: bool,
}

impl Default for LoggingPlugin {
    fn default() -> Self {
        Self {
            level: log::Level::Info,
            include_payload: false,
        }
    }
}

impl LoggingPlugin {
    pub const ID: &'static str = "logging";

    pub fn new(level: log::Level) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }

    /// Also logs the hook payload, at `debug`.
    #[must_use]
    pub fn with_payload(mut self) -> Self {
        self.include_payload = true;
        self
    }

    fn log(&self, hook: HookName, ctx: &HookContext, payload: &Value) {
        let level = if hook == HookName::OnError {
            log::Level::Warn
        } else {
            self.level
        };
        log::log!(level, "[{}] {hook}", ctx.request_id);
        if self.include_payload {
            log::debug!("[{}] {hook} payload: {payload}", ctx.request_id);
        }
    }
}

impl Plugin for LoggingPlugin {
    fn id(&self) -> &str {
        Self::ID
    }

    fn hooks(self: Arc<Self>) -> Vec<Hook> {
        LOGGED_HOOKS
            .into_iter()
            .map(|hook| {
                let this = self.clone();
                Hook::new(hook, 0, move |ctx: HookContext, payload: &Value| {
                    this.log(hook, &ctx, payload);
                    Ok(ctx)
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::hooks::HookEngine;

    #[test]
    fn test_logging_plugin_observes_without_mutating() {
        let engine = HookEngine::new();
        engine
            .register_plugin(Arc::new(LoggingPlugin::new(log::Level::Debug).with_payload()))
            .unwrap();

        for hook in LOGGED_HOOKS {
            assert_eq!(engine.handler_count(hook), 1, "{hook}");
        }
        assert_eq!(engine.handler_count(HookName::OnShutdown), 0);

        let ctx = HookContext::new("r1", json!({"to": "0x1"}));
        let out = engine.fire(HookName::BeforeSimulation, ctx.clone(), &json!({"to": "0x1"}));
        assert_eq!(out, ctx);
    }
}
