//! # hypersim
//!
//! Rust SDK for the HyperSim transaction simulation service on HyperEVM.
//!
//! Besides the RPC client itself the crate provides the fabric every call
//! runs through: a hook engine that lets plugins observe or short-circuit
//! operations, retry with exponential backoff behind a per-endpoint circuit
//! breaker, a bounded cache with pluggable eviction, and a streaming client
//! that keeps its subscriptions across reconnects.
//!
//! ## Quick Navigation
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`http`] | JSON-RPC client: `simulate`, `network_status`, raw requests |
//! | [`hooks`] | Hook engine, plugin registry, middleware chain |
//! | [`plugins`] | Built-in logging, metrics and caching plugins, retry and breaker middleware |
//! | [`resilience`] | Retry policy and circuit breaker |
//! | [`cache`] | LRU / LFU / TTL cache |
//! | [`stream`] | Persistent streaming client |
//! | [`config`] | Configuration loading and validation |
//! | [`types`] | Request and response types |
//! | [`abi`] | Call-data layout helpers |
//!
//! ## Getting Started
//!
//! ```no_run
//! use std::sync::Arc;
//! use hypersim::{Address, U256, plugins::{CachingPlugin, LoggingPlugin}, types::TransactionRequest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = hypersim::testnet();
//!     client.hooks().register_plugin(Arc::new(LoggingPlugin::default()))?;
//!     client.hooks().register_plugin(Arc::new(CachingPlugin::default()))?;
//!
//!     let tx = TransactionRequest::new(Address::ZERO)
//!         .to(Address::repeat_byte(0x22))
//!         .value(U256::from(1_000u64));
//!     let result = client.simulate(&tx).await?;
//!     println!("success={} gas={}", result.success, result.gas_used);
//!     Ok(())
//! }
//! ```
//!
//! ## Errors
//!
//! Every fallible operation returns [`Result`] with the crate [`Error`]. Use
//! [`Error::is_retryable`] and [`Error::is_circuit_open`] to tell transient
//! failures from a cooling-down endpoint. Plugin handlers return
//! `anyhow::Result`; their failures are logged and never reach the caller.
//!
//! ## Logging
//!
//! The crate logs through the [`log`](https://docs.rs/log) facade and installs
//! no logger of its own.

pub mod abi;
pub mod cache;
pub mod config;
mod error;
pub mod hooks;
pub mod http;
pub mod plugins;
pub mod resilience;
pub mod stream;
pub mod types;

pub use alloy::primitives::{Address, U256, address};
pub use error::{Error, Result};
pub use url::Url;

use stream::{StreamClient, StreamConfig};

/// Mainnet JSON-RPC endpoint.
///
/// URL: `https://mainnet.hyperevm.com`
#[inline(always)]
pub fn mainnet_url() -> Url {
    "https://mainnet.hyperevm.com".parse().unwrap()
}

/// Testnet JSON-RPC endpoint.
///
/// URL: `https://testnet.hyperevm.com`
#[inline(always)]
pub fn testnet_url() -> Url {
    "https://testnet.hyperevm.com".parse().unwrap()
}

/// Mainnet streaming endpoint.
///
/// URL: `wss://mainnet-ws.hyperevm.com`
#[inline(always)]
pub fn mainnet_ws_url() -> Url {
    "wss://mainnet-ws.hyperevm.com".parse().unwrap()
}

/// Testnet streaming endpoint.
///
/// URL: `wss://testnet-ws.hyperevm.com`
#[inline(always)]
pub fn testnet_ws_url() -> Url {
    "wss://testnet-ws.hyperevm.com".parse().unwrap()
}

/// RPC client for mainnet with default settings.
///
/// ```
/// let client = hypersim::mainnet();
/// assert_eq!(client.url().as_str(), "https://mainnet.hyperevm.com/");
/// ```
pub fn mainnet() -> http::Client {
    http::Client::new(mainnet_url())
}

/// RPC client for testnet with default settings.
pub fn testnet() -> http::Client {
    http::Client::new(testnet_url())
}

/// Streaming client for mainnet. Must be called within a tokio runtime.
pub fn mainnet_ws() -> StreamClient {
    StreamClient::ws(mainnet_ws_url(), StreamConfig::default())
}

/// Streaming client for testnet. Must be called within a tokio runtime.
pub fn testnet_ws() -> StreamClient {
    StreamClient::ws(testnet_ws_url(), StreamConfig::default())
}

/// Roughly 30 years, used when a deadline would overflow [`tokio::time::Instant`].
const FAR_FUTURE: std::time::Duration = std::time::Duration::from_secs(86400 * 365 * 30);

/// `from + after`, saturating at a far-future instant.
pub(crate) fn deadline(from: tokio::time::Instant, after: std::time::Duration) -> tokio::time::Instant {
    from.checked_add(after).unwrap_or_else(|| from + FAR_FUTURE)
}
