//! Offline tour of the hook engine, middleware and resilience layers.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use clap::Parser;
use futures::FutureExt;
use hypersim::{
    Error,
    hooks::{CallContext, Hook, HookContext, HookEngine, HookName, MiddlewareChain, Operation, Plugin},
    plugins::{BreakerMiddleware, MetricsPlugin, RetryMiddleware},
    resilience::{BreakerConfig, CircuitBreaker, RetryConfig},
};
use serde_json::{Value, json};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Failures before the flaky operation succeeds.
    #[arg(short, long, default_value_t = 2)]
    failures: u32,
    /// Retry attempts.
    #[arg(short, long, default_value_t = 4)]
    attempts: u32,
}

/// Rejects simulations sent to the zero address.
struct Guard;

impl Plugin for Guard {
    fn id(&self) -> &str {
        "guard"
    }

    fn hooks(self: Arc<Self>) -> Vec<Hook> {
        vec![Hook::new(
            HookName::BeforeSimulation,
            0,
            |ctx: HookContext, tx: &Value| {
                if tx["to"] == "0x0000000000000000000000000000000000000000" {
                    return Ok(ctx.halt_with(json!({"success": false, "error": "blocked"})));
                }
                Ok(ctx)
            },
        )]
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = simple_logger::init_with_level(log::Level::Debug);
    let args = Cli::parse();

    let hooks = HookEngine::new();
    let metrics = Arc::new(MetricsPlugin::new());
    hooks.register_plugin(Arc::new(Guard))?;
    hooks.register_plugin(metrics.clone())?;
    for info in hooks.plugins() {
        println!("{} v{} enabled={} hooks={:?}", info.id, info.version, info.enabled, info.hooks);
    }

    let blocked = json!({"to": "0x0000000000000000000000000000000000000000"});
    let ctx = hooks.fire(
        HookName::BeforeSimulation,
        HookContext::new("demo-1", blocked.clone()),
        &blocked,
    );
    println!("halted={} patch={:?}", ctx.halt, ctx.patch);

    let chain = MiddlewareChain::<Value>::new();
    chain.add(
        0,
        Arc::new(RetryMiddleware::new(RetryConfig {
            max_attempts: args.attempts,
            initial_delay: Duration::from_millis(100),
            ..RetryConfig::default()
        })),
    );
    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
    chain.add(1, Arc::new(BreakerMiddleware::new(breaker.clone())));

    let failures = args.failures;
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let mut cx = CallContext::new("demo-2", Operation::Simulation, "http://flaky");
    let out = chain
        .run(&mut cx, move |cx| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let attempt = cx.attempt;
            async move {
                if n < failures {
                    Err(Error::network("connection reset"))
                } else {
                    Ok(json!({"success": true, "attempt": attempt}))
                }
            }
            .boxed()
        })
        .await;

    println!("result={out:?} calls={}", calls.load(Ordering::SeqCst));
    println!("breaker={:?}", breaker.snapshot());
    println!("metrics={:?}", metrics.snapshot());

    hooks.shutdown();
    Ok(())
}
