//! Error taxonomy shared by every SDK operation.
//!
//! Callers of a wrapped operation see either the underlying error (once the
//! retry budget is exhausted) or [`Error::CircuitOpen`]. The two are kept
//! distinct so applications can pick a different backoff or UX for each:
//!
//! ```
//! use hypersim::Error;
//!
//! fn describe(err: &Error) -> &'static str {
//!     if err.is_circuit_open() {
//!         "endpoint is cooling down"
//!     } else if err.is_retryable() {
//!         "transient failure"
//!     } else {
//!         "permanent failure"
//!     }
//! }
//!
//! assert_eq!(describe(&Error::network("reset")), "transient failure");
//! ```

use crate::hooks::HookName;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// SDK error.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::Error, derive_more::IsVariant)]
pub enum Error {
    /// Invalid input. Never retried.
    #[display("validation error: {message}")]
    Validation { message: String },
    /// Transport-level failure. Retried and counted by the circuit breaker.
    #[display("network error: {message}")]
    Network { message: String },
    /// The request did not complete in time. Retried and counted by the circuit breaker.
    #[display("timed out after {millis}ms")]
    Timeout { millis: u64 },
    /// Raised locally while the endpoint's breaker is open; no request was sent.
    #[display("circuit open for {endpoint}")]
    CircuitOpen { endpoint: String },
    /// A hook handler failed. Logged at the firing boundary, never returned by `fire`.
    #[display("hook {hook} failed in plugin {plugin}: {message}")]
    Hook {
        plugin: String,
        hook: HookName,
        message: String,
    },
    /// Plugin lifecycle failure.
    #[display("plugin {plugin}: {message}")]
    Plugin { plugin: String, message: String },
    /// A plugin tried to attach a second handler to the same hook.
    #[display("plugin {plugin} already has a handler for {hook}")]
    DuplicateRegistration { plugin: String, hook: HookName },
    /// The remote endpoint answered with a JSON-RPC error.
    #[display("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    /// Payload could not be encoded or decoded.
    #[display("serialization error: {message}")]
    Serialization { message: String },
    /// Credentials were rejected. Never retried.
    #[display("authentication error: {message}")]
    Authentication { message: String },
    /// The streaming client was shut down.
    #[display("client closed")]
    Closed,
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::Timeout {
            millis: after.as_millis() as u64,
        }
    }

    pub fn plugin(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Plugin {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Whether retrying the same request may succeed.
    ///
    /// Only transport failures and timeouts qualify. Everything else
    /// short-circuits on the first attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout { .. })
    }

    /// Short, stable name of the error class.
    ///
    /// Used as the `kind` field of `on-error` hook payloads.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Network { .. } => "network",
            Self::Timeout { .. } => "timeout",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Hook { .. } => "hook",
            Self::Plugin { .. } => "plugin",
            Self::DuplicateRegistration { .. } => "duplicate_registration",
            Self::Rpc { .. } => "rpc",
            Self::Serialization { .. } => "serialization",
            Self::Authentication { .. } => "authentication",
            Self::Closed => "closed",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(Error::network("reset").is_retryable());
        assert!(Error::timeout(Duration::from_secs(1)).is_retryable());
        assert!(!Error::validation("bad").is_retryable());
        assert!(
            !Error::Authentication {
                message: "nope".into()
            }
            .is_retryable()
        );
        assert!(
            !Error::CircuitOpen {
                endpoint: "rpc".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_display() {
        let err = Error::DuplicateRegistration {
            plugin: "metrics".into(),
            hook: HookName::BeforeSimulation,
        };
        assert_eq!(
            err.to_string(),
            "plugin metrics already has a handler for before-simulation"
        );
        assert_eq!(
            Error::timeout(Duration::from_millis(1500)).to_string(),
            "timed out after 1500ms"
        );
    }

    #[test]
    fn test_circuit_open_is_distinguishable() {
        let err = Error::CircuitOpen {
            endpoint: "https://rpc".into(),
        };
        assert!(err.is_circuit_open());
        assert!(!Error::network("x").is_circuit_open());
        assert_eq!(err.kind(), "circuit_open");
    }
}
