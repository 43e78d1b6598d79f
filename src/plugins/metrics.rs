use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{DurationMilliSeconds, serde_as};

use crate::hooks::{Hook, HookContext, HookName, Operation, Plugin};

const START_KEY: &str = "metrics_start";

/// Request counters and average latency.
///
/// The `before-*` handler stamps the context metadata with a start time in
/// microseconds; the matching `after-*` handler reads it back. A request that
/// never reaches `after-*` counts towards `requests` only, or towards
/// `errors` if `on-error` fired.
#[derive(Debug, Default)]
pub struct MetricsPlugin {
    requests: AtomicU64,
    successes: AtomicU64,
    errors: AtomicU64,
    latency_micros: AtomicU64,
}

#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub errors: u64,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub average_latency: Duration,
}

impl MetricsPlugin {
    pub const ID: &'static str = "metrics";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let successes = self.successes.load(Ordering::Relaxed);
        let total = self.latency_micros.load(Ordering::Relaxed);
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            successes,
            errors: self.errors.load(Ordering::Relaxed),
            average_latency: Duration::from_micros(total.checked_div(successes).unwrap_or(0)),
        }
    }

    pub fn reset(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.latency_micros.store(0, Ordering::Relaxed);
    }

    fn before(&self, mut ctx: HookContext) -> HookContext {
        self.requests.fetch_add(1, Ordering::Relaxed);
        ctx.set_meta(START_KEY, Utc::now().timestamp_micros());
        ctx
    }

    fn after(&self, ctx: HookContext) -> HookContext {
        self.successes.fetch_add(1, Ordering::Relaxed);
        if let Some(start) = ctx.meta(START_KEY).and_then(Value::as_i64) {
            let elapsed = Utc::now().timestamp_micros().saturating_sub(start).max(0);
            self.latency_micros
                .fetch_add(elapsed as u64, Ordering::Relaxed);
        }
        ctx
    }
}

impl Plugin for MetricsPlugin {
    fn id(&self) -> &str {
        Self::ID
    }

    fn hooks(self: Arc<Self>) -> Vec<Hook> {
        let mut hooks = Vec::with_capacity(7);
        for op in [Operation::Request, Operation::Simulation, Operation::AiAnalysis] {
            let this = self.clone();
            hooks.push(Hook::new(op.before(), 5, move |ctx: HookContext, _: &Value| {
                Ok(this.before(ctx))
            }));
            let this = self.clone();
            hooks.push(Hook::new(op.after(), 5, move |ctx: HookContext, _: &Value| {
                Ok(this.after(ctx))
            }));
        }
        hooks.push(Hook::new(HookName::OnError, 5, move |ctx: HookContext, _: &Value| {
            self.errors.fetch_add(1, Ordering::Relaxed);
            Ok(ctx)
        }));
        hooks
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::hooks::HookEngine;

    #[test]
    fn test_counts_requests_successes_and_errors() {
        let metrics = Arc::new(MetricsPlugin::new());
        let engine = HookEngine::new();
        engine.register_plugin(metrics.clone()).unwrap();

        // one successful simulation, metadata carried from before to after
        let ctx = engine.fire(
            HookName::BeforeSimulation,
            HookContext::new("r1", json!({})),
            &json!({}),
        );
        assert!(ctx.meta(START_KEY).is_some());
        engine.fire(HookName::AfterSimulation, ctx, &json!({"success": true}));

        // one failed request
        let ctx = engine.fire(
            HookName::BeforeRequest,
            HookContext::new("r2", json!({})),
            &json!({}),
        );
        engine.fire(HookName::OnError, ctx, &json!({"kind": "network"}));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.successes, 1);
        assert_eq!(snapshot.errors, 1);

        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_after_without_start_still_counts() {
        let metrics = MetricsPlugin::new();
        metrics.after(HookContext::new("r", Value::Null));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.successes, 1);
        assert_eq!(snapshot.average_latency, Duration::ZERO);
    }
}
