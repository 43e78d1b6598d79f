use std::{
    any::Any,
    collections::{HashMap, HashSet},
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use super::{Handler, Hook, HookContext, HookName, Plugin};
use crate::{Error, Result};

#[derive(Clone)]
struct Registration {
    plugin: Arc<str>,
    priority: i32,
    seq: u64,
    handler: Arc<dyn Handler>,
}

type Registry = HashMap<HookName, Vec<Registration>>;

struct PluginSlot {
    plugin: Arc<dyn Plugin>,
    enabled: bool,
    order: u64,
}

/// Summary of a registered plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub id: String,
    pub version: String,
    pub enabled: bool,
    pub hooks: Vec<HookName>,
}

/// Registry of hook handlers and plugins.
///
/// The handler registry is copy-on-write: writers build a new map and swap it
/// in, readers take a snapshot. A `fire` in progress therefore never observes
/// a half-updated handler list, and handlers are free to register or
/// unregister plugins while they run.
pub struct HookEngine {
    registry: ArcSwap<Registry>,
    // serializes snapshot-and-swap writers
    writer: Mutex<()>,
    plugins: RwLock<HashMap<String, PluginSlot>>,
    seq: AtomicU64,
    hook_errors: AtomicU64,
}

impl Default for HookEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl HookEngine {
    pub fn new() -> Self {
        Self {
            registry: ArcSwap::from_pointee(Registry::new()),
            writer: Mutex::new(()),
            plugins: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            hook_errors: AtomicU64::new(0),
        }
    }

    /// Attaches `handler` to `hook` on behalf of `plugin`.
    ///
    /// Fails with [`Error::DuplicateRegistration`] if the plugin already has a
    /// handler for that hook.
    pub fn register<F>(&self, plugin: &str, hook: HookName, priority: i32, handler: F) -> Result<()>
    where
        F: Fn(HookContext, &Value) -> anyhow::Result<HookContext> + Send + Sync + 'static,
    {
        self.install(plugin, vec![Hook::new(hook, priority, handler)])
    }

    /// Removes every handler owned by `plugin`. Returns how many were removed.
    ///
    /// Calling it for an unknown plugin is a no-op.
    pub fn unregister_all(&self, plugin: &str) -> usize {
        let _guard = self.writer.lock();
        let current = self.registry.load_full();

        let removed: usize = current
            .values()
            .map(|list| list.iter().filter(|reg| &*reg.plugin == plugin).count())
            .sum();
        if removed == 0 {
            return 0;
        }

        let next: Registry = current
            .iter()
            .filter_map(|(name, list)| {
                let kept: Vec<_> = list
                    .iter()
                    .filter(|reg| &*reg.plugin != plugin)
                    .cloned()
                    .collect();
                (!kept.is_empty()).then_some((*name, kept))
            })
            .collect();
        self.registry.store(Arc::new(next));

        log::debug!("removed {removed} handler(s) of plugin {plugin}");
        removed
    }

    /// Runs every handler of `hook` in priority order.
    ///
    /// Each handler receives the context produced by the previous one. A
    /// handler that fails or panics is logged and skipped. Firing stops as
    /// soon as a handler sets `halt`; the returned context carries the flag so
    /// the caller can act on it.
    ///
    /// With no handlers attached `ctx` comes back untouched, `halt` included.
    /// Otherwise `halt` is cleared before the first handler runs.
    pub fn fire(&self, hook: HookName, mut ctx: HookContext, payload: &Value) -> HookContext {
        let registry = self.registry.load_full();
        let Some(handlers) = registry.get(&hook).filter(|list| !list.is_empty()) else {
            return ctx;
        };
        ctx.halt = false;

        for reg in handlers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                reg.handler.call(ctx.clone(), payload)
            }));

            match outcome {
                Ok(Ok(next)) => ctx = next,
                Ok(Err(err)) => self.report(&reg.plugin, hook, format!("{err:#}")),
                Err(panic) => self.report(&reg.plugin, hook, panic_message(&*panic)),
            }

            if ctx.halt {
                log::debug!("{hook} halted by plugin {}", reg.plugin);
                break;
            }
        }

        ctx
    }

    /// Number of handlers attached to `hook`.
    pub fn handler_count(&self, hook: HookName) -> usize {
        self.registry.load().get(&hook).map_or(0, Vec::len)
    }

    /// Total number of handler failures observed since creation.
    pub fn hook_errors(&self) -> u64 {
        self.hook_errors.load(Ordering::Relaxed)
    }

    /// Registers a plugin and all of its hooks.
    ///
    /// Either every hook is installed or none is. If [`Plugin::on_register`]
    /// fails the hooks are removed again and a [`Error::Plugin`] is returned.
    pub fn register_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let id = plugin.id().to_owned();

        {
            let mut plugins = self.plugins.write();
            if plugins.contains_key(&id) {
                log::warn!("plugin {id} is already registered");
                return Err(Error::plugin(id, "already registered"));
            }
            plugins.insert(
                id.clone(),
                PluginSlot {
                    plugin: plugin.clone(),
                    enabled: true,
                    order: self.seq.fetch_add(1, Ordering::Relaxed),
                },
            );
        }

        if let Err(err) = self.install(&id, plugin.clone().hooks()) {
            self.plugins.write().remove(&id);
            return Err(Error::plugin(id, err.to_string()));
        }

        if let Err(err) = plugin.on_register(self) {
            self.unregister_all(&id);
            self.plugins.write().remove(&id);
            return Err(Error::plugin(id, format!("{err:#}")));
        }

        log::info!("registered plugin {id} v{}", plugin.version());
        Ok(())
    }

    /// Removes a plugin and its hooks. Returns `false` if it was not registered.
    pub fn unregister_plugin(&self, id: &str) -> bool {
        let Some(slot) = self.plugins.write().remove(id) else {
            return false;
        };

        self.unregister_all(id);
        slot.plugin.on_unregister();
        log::info!("unregistered plugin {id}");
        true
    }

    /// Re-installs the hooks of a disabled plugin.
    pub fn enable_plugin(&self, id: &str) -> Result<()> {
        let plugin = {
            let mut plugins = self.plugins.write();
            let slot = plugins
                .get_mut(id)
                .ok_or_else(|| Error::plugin(id, "not registered"))?;
            if slot.enabled {
                return Ok(());
            }
            slot.enabled = true;
            slot.plugin.clone()
        };

        if let Err(err) = self.install(id, plugin.hooks()) {
            if let Some(slot) = self.plugins.write().get_mut(id) {
                slot.enabled = false;
            }
            return Err(Error::plugin(id, err.to_string()));
        }

        log::info!("enabled plugin {id}");
        Ok(())
    }

    /// Removes the hooks of a plugin but keeps it registered.
    pub fn disable_plugin(&self, id: &str) -> Result<()> {
        {
            let mut plugins = self.plugins.write();
            let slot = plugins
                .get_mut(id)
                .ok_or_else(|| Error::plugin(id, "not registered"))?;
            if !slot.enabled {
                return Ok(());
            }
            slot.enabled = false;
        }

        self.unregister_all(id);
        log::info!("disabled plugin {id}");
        Ok(())
    }

    /// Registered plugins in registration order.
    pub fn plugins(&self) -> Vec<PluginInfo> {
        let registry = self.registry.load_full();
        let plugins = self.plugins.read();

        let mut slots: Vec<_> = plugins.iter().collect();
        slots.sort_by_key(|(_, slot)| slot.order);

        slots
            .into_iter()
            .map(|(id, slot)| {
                let mut hooks: Vec<HookName> = registry
                    .iter()
                    .filter(|(_, list)| list.iter().any(|reg| &*reg.plugin == id.as_str()))
                    .map(|(name, _)| *name)
                    .collect();
                hooks.sort();
                PluginInfo {
                    id: id.clone(),
                    version: slot.plugin.version().to_owned(),
                    enabled: slot.enabled,
                    hooks,
                }
            })
            .collect()
    }

    /// Health of each registered plugin.
    pub fn health(&self) -> HashMap<String, bool> {
        let plugins: Vec<_> = self
            .plugins
            .read()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.plugin.clone()))
            .collect();

        plugins
            .into_iter()
            .map(|(id, plugin)| {
                let healthy = plugin.is_healthy();
                if !healthy {
                    log::warn!("plugin {id} failed health check");
                }
                (id, healthy)
            })
            .collect()
    }

    /// Fires `on-shutdown` and unregisters every plugin.
    pub fn shutdown(&self) {
        self.fire(
            HookName::OnShutdown,
            HookContext::new("shutdown", Value::Null),
            &Value::Null,
        );

        let ids: Vec<String> = self.plugins.read().keys().cloned().collect();
        for id in ids {
            self.unregister_plugin(&id);
        }
    }

    fn install(&self, plugin: &str, hooks: Vec<Hook>) -> Result<()> {
        let _guard = self.writer.lock();
        let current = self.registry.load_full();

        let mut seen = HashSet::new();
        for hook in &hooks {
            let exists = current
                .get(&hook.name)
                .is_some_and(|list| list.iter().any(|reg| &*reg.plugin == plugin));
            if exists || !seen.insert(hook.name) {
                log::warn!("plugin {plugin} tried to register {} twice", hook.name);
                return Err(Error::DuplicateRegistration {
                    plugin: plugin.to_owned(),
                    hook: hook.name,
                });
            }
        }

        let owner: Arc<str> = Arc::from(plugin);
        let mut next = (*current).clone();
        for hook in hooks {
            let list = next.entry(hook.name).or_default();
            list.push(Registration {
                plugin: owner.clone(),
                priority: hook.priority,
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
                handler: hook.handler,
            });
            list.sort_by_key(|reg| (reg.priority, reg.seq));
        }
        self.registry.store(Arc::new(next));

        Ok(())
    }

    fn report(&self, plugin: &str, hook: HookName, message: String) {
        self.hook_errors.fetch_add(1, Ordering::Relaxed);
        let err = Error::Hook {
            plugin: plugin.to_owned(),
            hook,
            message,
        };
        log::warn!("{err}");
    }
}

impl std::fmt::Debug for HookEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookEngine")
            .field("plugins", &self.plugins.read().len())
            .field("hook_errors", &self.hook_errors())
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "handler panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;

    fn push(tag: &'static str) -> impl Fn(HookContext, &Value) -> anyhow::Result<HookContext> {
        move |mut ctx: HookContext, _: &Value| {
            let mut order = ctx
                .meta("order")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            order.push(json!(tag));
            ctx.set_meta("order", order);
            Ok(ctx)
        }
    }

    fn order(ctx: &HookContext) -> Vec<String> {
        ctx.meta("order")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn fire(engine: &HookEngine, hook: HookName) -> HookContext {
        engine.fire(hook, HookContext::new("req", Value::Null), &Value::Null)
    }

    #[test]
    fn test_priority_order_with_registration_tiebreak() {
        let engine = HookEngine::new();
        engine.register("c", HookName::BeforeRequest, 20, push("c")).unwrap();
        engine.register("a", HookName::BeforeRequest, 5, push("a")).unwrap();
        engine.register("b1", HookName::BeforeRequest, 10, push("b1")).unwrap();
        engine.register("b2", HookName::BeforeRequest, 10, push("b2")).unwrap();

        let ctx = fire(&engine, HookName::BeforeRequest);
        assert_eq!(order(&ctx), ["a", "b1", "b2", "c"]);
    }

    #[test]
    fn test_halt_stops_chain() {
        let engine = HookEngine::new();
        let late = Arc::new(AtomicUsize::new(0));

        engine.register("first", HookName::BeforeSimulation, 1, push("first")).unwrap();
        engine
            .register("stopper", HookName::BeforeSimulation, 2, |ctx, _| {
                Ok(ctx.halt_with(json!("cached")))
            })
            .unwrap();
        let counter = late.clone();
        engine
            .register("late", HookName::BeforeSimulation, 3, move |ctx, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(ctx)
            })
            .unwrap();

        let ctx = fire(&engine, HookName::BeforeSimulation);
        assert!(ctx.halt);
        assert_eq!(ctx.patch, Some(json!("cached")));
        assert_eq!(order(&ctx), ["first"]);
        assert_eq!(late.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failing_handler_is_a_noop() {
        let engine = HookEngine::new();
        engine.register("a", HookName::OnError, 1, push("a")).unwrap();
        engine
            .register("broken", HookName::OnError, 2, |mut ctx, _| {
                ctx.set_meta("clobbered", true);
                anyhow::bail!("boom")
            })
            .unwrap();
        engine
            .register("panicky", HookName::OnError, 3, |_, _| panic!("kaboom"))
            .unwrap();
        engine.register("d", HookName::OnError, 4, push("d")).unwrap();

        let ctx = fire(&engine, HookName::OnError);
        assert_eq!(order(&ctx), ["a", "d"]);
        assert!(ctx.meta("clobbered").is_none());
        assert_eq!(engine.hook_errors(), 2);
    }

    #[test]
    fn test_fire_without_handlers_returns_input() {
        let engine = HookEngine::new();
        let mut input = HookContext::new("req", json!({"x": 1}));
        input.set_meta("k", "v");

        let out = engine.fire(HookName::AfterResponse, input.clone(), &Value::Null);
        assert_eq!(out, input);

        let halted = input.halt_with(json!({"cached": true}));
        let out = engine.fire(HookName::OnError, halted.clone(), &Value::Null);
        assert!(out.halt);
        assert_eq!(out, halted);
    }

    #[test]
    fn test_duplicate_registration() {
        let engine = HookEngine::new();
        engine.register("p", HookName::OnConnect, 1, push("x")).unwrap();

        let err = engine
            .register("p", HookName::OnConnect, 2, push("y"))
            .unwrap_err();
        assert_eq!(
            err,
            Error::DuplicateRegistration {
                plugin: "p".into(),
                hook: HookName::OnConnect,
            }
        );
        // a different hook is fine
        engine.register("p", HookName::OnDisconnect, 1, push("z")).unwrap();
        assert_eq!(engine.handler_count(HookName::OnConnect), 1);
    }

    #[test]
    fn test_unregister_all_is_idempotent() {
        let engine = HookEngine::new();
        engine.register("p", HookName::OnConnect, 1, push("x")).unwrap();
        engine.register("p", HookName::OnDisconnect, 1, push("x")).unwrap();
        engine.register("q", HookName::OnConnect, 1, push("y")).unwrap();

        assert_eq!(engine.unregister_all("p"), 2);
        assert_eq!(engine.unregister_all("p"), 0);
        assert_eq!(engine.handler_count(HookName::OnConnect), 1);
        assert_eq!(engine.handler_count(HookName::OnDisconnect), 0);
    }

    #[test]
    fn test_handler_may_mutate_registry_while_firing() {
        let engine = Arc::new(HookEngine::new());
        let weak = Arc::downgrade(&engine);
        engine
            .register("self-removing", HookName::BeforeRequest, 1, move |ctx, _| {
                if let Some(engine) = weak.upgrade() {
                    engine.unregister_all("self-removing");
                    engine.register("added", HookName::AfterResponse, 1, |ctx, _| Ok(ctx))?;
                }
                Ok(ctx)
            })
            .unwrap();
        engine.register("after", HookName::BeforeRequest, 2, push("after")).unwrap();

        // the snapshot taken at the start of the chain still runs "after"
        let ctx = fire(&engine, HookName::BeforeRequest);
        assert_eq!(order(&ctx), ["after"]);
        assert_eq!(engine.handler_count(HookName::BeforeRequest), 1);
        assert_eq!(engine.handler_count(HookName::AfterResponse), 1);
    }

    struct Recorder {
        fail_register: bool,
        unregistered: AtomicUsize,
    }

    impl Plugin for Recorder {
        fn id(&self) -> &str {
            "recorder"
        }

        fn hooks(self: Arc<Self>) -> Vec<Hook> {
            vec![
                Hook::new(HookName::BeforeRequest, 1, push("rec")),
                Hook::new(HookName::AfterResponse, 1, push("rec")),
            ]
        }

        fn on_register(&self, _engine: &HookEngine) -> anyhow::Result<()> {
            if self.fail_register {
                anyhow::bail!("refusing");
            }
            Ok(())
        }

        fn on_unregister(&self) {
            self.unregistered.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_plugin_lifecycle() {
        let engine = HookEngine::new();
        let plugin = Arc::new(Recorder {
            fail_register: false,
            unregistered: AtomicUsize::new(0),
        });

        engine.register_plugin(plugin.clone()).unwrap();
        assert!(engine.register_plugin(plugin.clone()).unwrap_err().is_plugin());

        let info = engine.plugins();
        assert_eq!(info.len(), 1);
        assert_eq!(
            info[0].hooks,
            [HookName::BeforeRequest, HookName::AfterResponse]
        );

        engine.disable_plugin("recorder").unwrap();
        assert_eq!(engine.handler_count(HookName::BeforeRequest), 0);
        assert!(!engine.plugins()[0].enabled);

        engine.enable_plugin("recorder").unwrap();
        assert_eq!(engine.handler_count(HookName::BeforeRequest), 1);

        assert!(engine.unregister_plugin("recorder"));
        assert!(!engine.unregister_plugin("recorder"));
        assert_eq!(plugin.unregistered.load(Ordering::SeqCst), 1);
        assert_eq!(engine.handler_count(HookName::AfterResponse), 0);
    }

    #[test]
    fn test_failed_on_register_leaves_prior_state() {
        let engine = HookEngine::new();
        engine.register("other", HookName::BeforeRequest, 1, push("o")).unwrap();

        let err = engine
            .register_plugin(Arc::new(Recorder {
                fail_register: true,
                unregistered: AtomicUsize::new(0),
            }))
            .unwrap_err();

        assert!(err.is_plugin());
        assert!(engine.plugins().is_empty());
        assert_eq!(engine.handler_count(HookName::BeforeRequest), 1);
        assert_eq!(engine.handler_count(HookName::AfterResponse), 0);
    }

    #[test]
    fn test_shutdown_fires_and_clears() {
        let engine = HookEngine::new();
        let fired = Arc::new(AtomicUsize::new(0));
        engine
            .register_plugin(Arc::new(Recorder {
                fail_register: false,
                unregistered: AtomicUsize::new(0),
            }))
            .unwrap();
        let counter = fired.clone();
        engine
            .register("watcher", HookName::OnShutdown, 1, move |ctx, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(ctx)
            })
            .unwrap();

        engine.shutdown();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(engine.plugins().is_empty());
        assert_eq!(engine.health().len(), 0);
    }
}
