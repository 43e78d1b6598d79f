use std::sync::Arc;

use alloy::primitives::{Bytes, U256};
use clap::Parser;
use hypersim::{
    Address, Url,
    config::Config,
    http::Client,
    plugins::{CachingPlugin, LoggingPlugin, MetricsPlugin},
    types::TransactionRequest,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Sender address.
    #[arg(short, long)]
    from: Address,
    /// Recipient address.
    #[arg(short, long)]
    to: Address,
    /// Value in wei.
    #[arg(short, long, default_value = "0")]
    value: U256,
    /// Hex encoded call data.
    #[arg(short, long)]
    data: Option<Bytes>,
    /// RPC url, defaults to mainnet.
    #[arg(short, long)]
    rpc_url: Option<Url>,
    /// JSON config file.
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = simple_logger::init_with_level(log::Level::Debug);
    let args = Cli::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(url) = args.rpc_url {
        config.rpc_url = Some(url);
    }

    let client = Client::from_config(&config);
    let metrics = Arc::new(MetricsPlugin::new());
    client.hooks().register_plugin(Arc::new(LoggingPlugin::default()))?;
    client.hooks().register_plugin(metrics.clone())?;
    client
        .hooks()
        .register_plugin(Arc::new(CachingPlugin::new(config.cache.clone())))?;

    let mut tx = TransactionRequest::new(args.from).to(args.to).value(args.value);
    if let Some(data) = args.data {
        tx = tx.data(data);
    }

    // second run is answered from the cache
    for _ in 0..2 {
        let result = client.simulate(&tx).await?;
        println!(
            "success={} gas={} block={} ({})",
            result.success, result.gas_used, result.estimated_block, result.block_type
        );
        if let Some(reason) = result.revert_reason {
            println!("reverted: {reason}");
        }
    }

    println!("{:?}", metrics.snapshot());
    println!("{:?}", client.resilience().breaker().snapshot());

    client.hooks().shutdown();
    Ok(())
}
