use std::sync::Arc;

use alloy::primitives::keccak256;
use serde_json::Value;

use crate::{
    cache::{CacheConfig, CacheStats, EvictionCache},
    hooks::{Hook, HookContext, HookName, Plugin},
};

const KEY: &str = "cache_key";
const HIT: &str = "cache_hit";

/// Serves repeated simulations from an [`EvictionCache`].
///
/// `before-simulation` (priority 1) looks the request up and, on a hit, halts
/// the chain with the cached response as patch so no network call is made.
/// `after-simulation` (priority 10) stores responses, skipping those that
/// report `"success": false`.
#[derive(Debug)]
pub struct CachingPlugin {
    cache: Arc<EvictionCache<String, Value>>,
}

impl Default for CachingPlugin {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl CachingPlugin {
    pub const ID: &'static str = "caching";

    pub fn new(config: CacheConfig) -> Self {
        Self {
            cache: Arc::new(EvictionCache::new(config)),
        }
    }

    /// Underlying cache, e.g. to start its sweeper.
    pub fn cache(&self) -> &Arc<EvictionCache<String, Value>> {
        &self.cache
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Cache key of a request payload: keccak-256 of its JSON encoding.
    pub fn key_for(payload: &Value) -> String {
        keccak256(payload.to_string()).to_string()
    }

    fn lookup(&self, mut ctx: HookContext, request: &Value) -> HookContext {
        let key = Self::key_for(request);
        match self.cache.get(&key) {
            Some(cached) => {
                log::debug!("[{}] cache hit {key}", ctx.request_id);
                ctx.set_meta(HIT, true);
                ctx.set_meta(KEY, key);
                ctx.halt_with(cached)
            }
            None => {
                ctx.set_meta(HIT, false);
                ctx.set_meta(KEY, key);
                ctx
            }
        }
    }

    fn store(&self, ctx: HookContext, response: &Value) -> HookContext {
        if ctx.meta(HIT).and_then(Value::as_bool) == Some(true) {
            return ctx;
        }
        if response.get("success").and_then(Value::as_bool) == Some(false) {
            return ctx;
        }
        if let Some(key) = ctx.meta(KEY).and_then(Value::as_str) {
            self.cache.set(key.to_owned(), response.clone());
        }
        ctx
    }
}

impl Plugin for CachingPlugin {
    fn id(&self) -> &str {
        Self::ID
    }

    fn hooks(self: Arc<Self>) -> Vec<Hook> {
        let this = self.clone();
        vec![
            Hook::new(
                HookName::BeforeSimulation,
                1,
                move |ctx: HookContext, request: &Value| Ok(this.lookup(ctx, request)),
            ),
            Hook::new(
                HookName::AfterSimulation,
                10,
                move |ctx: HookContext, response: &Value| Ok(self.store(ctx, response)),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::hooks::HookEngine;

    fn simulate(engine: &HookEngine, request: &Value, response: &Value) -> (HookContext, bool) {
        let ctx = engine.fire(
            HookName::BeforeSimulation,
            HookContext::new("r", request.clone()),
            request,
        );
        if ctx.halt {
            return (ctx, true);
        }
        let ctx = engine.fire(HookName::AfterSimulation, ctx, response);
        (ctx, false)
    }

    #[test]
    fn test_second_identical_simulation_is_served_from_cache() {
        let plugin = Arc::new(CachingPlugin::default());
        let engine = HookEngine::new();
        engine.register_plugin(plugin.clone()).unwrap();

        let request = json!({"from": "0x1", "to": "0x2", "value": "0x0"});
        let response = json!({"success": true, "gasUsed": "0x5208"});

        let (_, short_circuited) = simulate(&engine, &request, &response);
        assert!(!short_circuited);

        let (ctx, short_circuited) = simulate(&engine, &request, &json!("unused"));
        assert!(short_circuited);
        assert_eq!(ctx.patch, Some(response));
        assert_eq!(ctx.meta(HIT), Some(&json!(true)));

        let stats = plugin.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn test_failed_simulations_are_not_cached() {
        let plugin = Arc::new(CachingPlugin::default());
        let engine = HookEngine::new();
        engine.register_plugin(plugin.clone()).unwrap();

        let request = json!({"to": "0x2"});
        simulate(&engine, &request, &json!({"success": false, "error": "revert"}));
        let (_, short_circuited) = simulate(&engine, &request, &json!({"success": true}));

        assert!(!short_circuited);
        assert_eq!(plugin.stats().size, 1);
    }
}
