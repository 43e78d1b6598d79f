//! SDK configuration.
//!
//! Every section has defaults, so a config file only needs the fields it
//! changes. Durations are integer milliseconds.
//!
//! ```
//! use std::time::Duration;
//! use hypersim::config::Config;
//!
//! let config = Config::from_json(r#"{
//!     "retry": { "maxAttempts": 5, "initialDelay": 250 },
//!     "cache": { "strategy": "lfu" }
//! }"#).unwrap();
//!
//! assert_eq!(config.retry.max_attempts, 5);
//! assert_eq!(config.retry.initial_delay, Duration::from_millis(250));
//! assert_eq!(config.breaker.failure_threshold, 5);
//! ```

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use url::Url;

use crate::{
    Error, Result,
    cache::CacheConfig,
    resilience::{BreakerConfig, RetryConfig},
    stream::StreamConfig,
};

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// JSON-RPC endpoint. Defaults to mainnet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpc_url: Option<Url>,
    /// Streaming endpoint. Defaults to mainnet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<Url>,
    /// Per-attempt HTTP timeout.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub cache: CacheConfig,
    pub streaming: StreamConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_url: None,
            ws_url: None,
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            cache: CacheConfig::default(),
            streaming: StreamConfig::default(),
        }
    }
}

impl Config {
    /// Parses and validates a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|err| Error::validation(format!("reading {}: {err}", path.display())))?;
        Self::from_json(&json)
    }

    pub fn rpc_url(&self) -> Url {
        self.rpc_url.clone().unwrap_or_else(crate::mainnet_url)
    }

    pub fn ws_url(&self) -> Url {
        self.ws_url.clone().unwrap_or_else(crate::mainnet_ws_url)
    }

    pub fn validate(&self) -> Result<()> {
        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(Error::validation("retry.maxAttempts must be at least 1"));
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err(Error::validation("retry.jitter must be within [0, 1]"));
        }
        if retry.multiplier.is_nan() || retry.multiplier < 1.0 {
            return Err(Error::validation("retry.multiplier must be at least 1"));
        }
        if retry.initial_delay > retry.max_delay {
            return Err(Error::validation(
                "retry.initialDelay must not exceed retry.maxDelay",
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(Error::validation(
                "breaker.failureThreshold must be at least 1",
            ));
        }
        if self.cache.capacity == 0 {
            return Err(Error::validation("cache.capacity must be at least 1"));
        }
        if self.streaming.heartbeat_interval.is_zero() {
            return Err(Error::validation(
                "streaming.heartbeatInterval must be positive",
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::validation("requestTimeout must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::cache::EvictionStrategy;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.jitter, 0.1);
        assert_eq!(config.breaker.minimum_requests, 10);
        assert_eq!(config.breaker.cooldown, Duration::from_secs(60));
        assert_eq!(config.cache.capacity, 1000);
        assert_eq!(config.cache.strategy, EvictionStrategy::Lru);
        assert_eq!(config.streaming.max_attempts, 10);
        assert_eq!(config.streaming.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.rpc_url(), crate::mainnet_url());
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(Config::from_json("{}").unwrap(), Config::default());
    }

    #[test]
    fn test_serialized_durations_are_millis() {
        let value = serde_json::to_value(Config::default()).unwrap();
        assert_eq!(value["retry"]["maxDelay"], 30_000);
        assert_eq!(value["streaming"]["baseDelay"], 5_000);
        assert_eq!(value["cache"]["defaultTtl"], 300_000);
        assert!(value.get("rpcUrl").is_none());
    }

    #[test]
    fn test_rejects_invalid_values() {
        for json in [
            r#"{"retry": {"maxAttempts": 0}}"#,
            r#"{"retry": {"jitter": 1.5}}"#,
            r#"{"retry": {"multiplier": 0.5}}"#,
            r#"{"cache": {"capacity": 0}}"#,
            r#"{"streaming": {"heartbeatInterval": 0}}"#,
        ] {
            let err = Config::from_json(json).unwrap_err();
            assert!(err.is_validation(), "{json}: {err}");
        }
        assert!(Config::from_json("not json").unwrap_err().is_serialization());
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("hypersim-config-{}.json", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, r#"{{"rpcUrl": "http://127.0.0.1:8545/", "breaker": {{"failureThreshold": 2}}}}"#).unwrap();
        drop(file);

        let config = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.rpc_url().as_str(), "http://127.0.0.1:8545/");
        assert_eq!(config.breaker.failure_threshold, 2);
        assert!(Config::from_file(&path).unwrap_err().is_validation());
    }
}
