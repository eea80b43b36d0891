//! Broker configuration.
//!
//! Defines the knobs the broker itself consumes. Loading these values from a
//! file, environment variables or CLI flags is an external collaborator's
//! job (see crate-level docs); this module only owns the struct and its
//! defaults.

use serde::{Deserialize, Serialize};

/// URI of a transport the broker should bind a [`crate::listener::Listener`]
/// to.
///
/// `Inproc` carries no address since in-process endpoints are paired
/// directly by the attaching code.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum TransportBind {
    /// In-process channel pairing; no network or filesystem resource.
    Inproc,
    /// Unix domain socket at the given path.
    Ipc(String),
    /// TCP listener at `host:port`.
    Tcp(String),
}

/// Default invocation timeout in seconds, applied when a request's
/// `server-exec-ctx` omits `invocation_timeout`.
pub const DEFAULT_INVOCATION_TIMEOUT_SECS: u64 = 5;

/// Default execution timeout in seconds, applied when a request's
/// `server-exec-ctx` omits `execution_timeout`.
pub const DEFAULT_EXECUTION_TIMEOUT_SECS: u64 = 5;

/// Broker-wide configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BrokerConfig {
    /// Transports the broker listens on.
    pub transports: Vec<TransportBind>,
    /// Fallback invocation timeout, in seconds, for requests that don't
    /// specify one.
    pub default_invocation_timeout_secs: u64,
    /// Fallback execution timeout, in seconds, for requests that don't
    /// specify one.
    pub default_execution_timeout_secs: u64,
    /// When `false`, all per-Thing executors run on one dedicated
    /// single-thread runtime instead of the default multi-threaded pool.
    pub threaded: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            transports: vec![TransportBind::Inproc],
            default_invocation_timeout_secs: DEFAULT_INVOCATION_TIMEOUT_SECS,
            default_execution_timeout_secs: DEFAULT_EXECUTION_TIMEOUT_SECS,
            threaded: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let config = BrokerConfig::default();
        assert_eq!(config.default_invocation_timeout_secs, 5);
        assert_eq!(config.default_execution_timeout_secs, 5);
        assert!(config.threaded);
        assert_eq!(config.transports, vec![TransportBind::Inproc]);
    }
}
