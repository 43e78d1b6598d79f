use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use hypersim::{
    Address, Url,
    hooks::HookEngine,
    plugins::LoggingPlugin,
    stream::{StreamClient, StreamConfig, StreamEvent, SubscriptionParams, Topic},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Coin to follow.
    #[arg(short, long, default_value = "BTC")]
    coin: String,
    /// Also follow fills of this user.
    #[arg(short, long)]
    user: Option<Address>,
    /// Streaming url, defaults to mainnet.
    #[arg(short, long)]
    ws_url: Option<Url>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = simple_logger::init_with_level(log::Level::Info);
    let args = Cli::parse();

    let hooks = Arc::new(HookEngine::new());
    hooks.register_plugin(Arc::new(LoggingPlugin::default()))?;

    let url = args.ws_url.unwrap_or_else(hypersim::mainnet_ws_url);
    let client = StreamClient::ws(url, StreamConfig::default()).with_hooks(hooks);

    let mut events = client.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                StreamEvent::StateChanged(state) => log::info!("state: {state}"),
                StreamEvent::Error(err) => log::warn!("stream error: {err}"),
                StreamEvent::Closed => break,
                _ => {}
            }
        }
    });

    client.connect().await?;
    client
        .subscribe(Topic::Trades, SubscriptionParams::coin(&args.coin))
        .await?;
    client
        .subscribe(Topic::L2Book, SubscriptionParams::coin(&args.coin))
        .await?;
    if let Some(user) = args.user {
        client
            .subscribe_with(
                Topic::UserFills,
                SubscriptionParams::user(user.to_string()),
                |fill| println!("fill: {}", fill.data),
            )
            .await?;
    }

    let mut messages = client.messages().take(100);
    while let Some(msg) = messages.next().await {
        println!("{}: {}", msg.kind, msg.data);
    }

    println!("{:?}", client.metrics());
    client.disconnect().await;
    Ok(())
}
