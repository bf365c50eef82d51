//! # Configuration
//!
//! Purpose: Turn declarative settings (JSON or programmatic) into the
//! resolved values the pool consumes.
//!
//! ## Design Principles
//! 1. **Declarative vs Resolved**: `PoolSettings` is the serde form with
//!    optional fields and defaults; `ConnectionPoolConfig` is what the pool
//!    reads. Only `resolve` crosses from one to the other.
//! 2. **Fatal at Resolution**: `min_pool_size > max_pool_size`, a zero
//!    maximum or a zero timeout fail resolution with `ConfigError`; the pool
//!    never sees such a config.
//! 3. **Durations in Milliseconds**: Declarative fields end in `Ms`.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::factory::DEFAULT_OPERATION_TIMEOUT;
use crate::failure::{self, FailurePolicyFactory};
use crate::mapping::DEFAULT_VBUCKET_COUNT;
use crate::transport::SocketTuning;

/// Configuration resolution failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("minPoolSize ({min}) is greater than maxPoolSize ({max})")]
    MinExceedsMax { min: usize, max: usize },

    #[error("maxPoolSize must be at least 1")]
    ZeroMaxPoolSize,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("server list is empty")]
    NoServers,

    #[error("failure policy threshold must be at least 1")]
    ZeroThreshold,

    #[error("invalid configuration document: {0}")]
    Parse(String),
}

/// Declarative failure-policy selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FailurePolicySettings {
    /// Mark the node dead on the first failure.
    #[default]
    FailImmediately,
    /// Tolerate `threshold - 1` failures within `reset_after_ms`.
    #[serde(rename_all = "camelCase")]
    Throttling { threshold: u32, reset_after_ms: u64 },
}

impl FailurePolicySettings {
    /// Builds the per-node policy factory.
    pub fn resolve(&self) -> Result<FailurePolicyFactory, ConfigError> {
        match *self {
            FailurePolicySettings::FailImmediately => Ok(failure::fail_immediately()),
            FailurePolicySettings::Throttling {
                threshold,
                reset_after_ms,
            } => {
                if threshold == 0 {
                    return Err(ConfigError::ZeroThreshold);
                }
                if reset_after_ms == 0 {
                    return Err(ConfigError::ZeroDuration("resetAfterMs"));
                }
                Ok(failure::throttling(threshold, Duration::from_millis(reset_after_ms)))
            }
        }
    }
}

/// Declarative pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolSettings {
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub connection_timeout_ms: u64,
    pub queue_timeout_ms: u64,
    pub receive_timeout_ms: u64,
    pub dead_timeout_ms: u64,
    pub linger_enabled: bool,
    pub linger_time_ms: u64,
    pub enable_tcp_keep_alives: bool,
    pub tcp_keep_alive_time_ms: u64,
    pub tcp_keep_alive_interval_ms: u64,
    pub failure_policy: FailurePolicySettings,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            min_pool_size: 10,
            max_pool_size: 20,
            connection_timeout_ms: 10_000,
            queue_timeout_ms: 2_500,
            receive_timeout_ms: 10_000,
            dead_timeout_ms: 2_000,
            linger_enabled: false,
            linger_time_ms: 10_000,
            enable_tcp_keep_alives: true,
            tcp_keep_alive_time_ms: 2 * 60 * 60 * 1000,
            tcp_keep_alive_interval_ms: 1_000,
            failure_policy: FailurePolicySettings::FailImmediately,
        }
    }
}

impl PoolSettings {
    /// Resolves into the pool's runtime configuration.
    ///
    /// # Errors
    /// `ConfigError` for any violated invariant; nothing is partially applied.
    pub fn resolve(&self) -> Result<ConnectionPoolConfig, ConfigError> {
        let config = ConnectionPoolConfig {
            min_pool_size: self.min_pool_size,
            max_pool_size: self.max_pool_size,
            connection_timeout: Duration::from_millis(self.connection_timeout_ms),
            queue_timeout: Duration::from_millis(self.queue_timeout_ms),
            receive_timeout: Duration::from_millis(self.receive_timeout_ms),
            dead_timeout: Duration::from_millis(self.dead_timeout_ms),
            linger_enabled: self.linger_enabled,
            linger_time: Duration::from_millis(self.linger_time_ms),
            enable_tcp_keep_alives: self.enable_tcp_keep_alives,
            tcp_keep_alive_time: Duration::from_millis(self.tcp_keep_alive_time_ms),
            tcp_keep_alive_interval: Duration::from_millis(self.tcp_keep_alive_interval_ms),
            failure_policy: Some(self.failure_policy.resolve()?),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Resolved per-node pool configuration.
#[derive(Clone)]
pub struct ConnectionPoolConfig {
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    /// Bound on establishing one connection.
    pub connection_timeout: Duration,
    /// Bound on waiting for a free connection.
    pub queue_timeout: Duration,
    /// Bound on waiting for a response on a leased connection.
    pub receive_timeout: Duration,
    /// Minimum time a dead node stays gated before one probe is allowed.
    pub dead_timeout: Duration,
    pub linger_enabled: bool,
    pub linger_time: Duration,
    pub enable_tcp_keep_alives: bool,
    pub tcp_keep_alive_time: Duration,
    pub tcp_keep_alive_interval: Duration,
    /// Per-node policy source; `None` or a declining factory selects the
    /// fail-immediately default.
    pub failure_policy: Option<FailurePolicyFactory>,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        let defaults = PoolSettings::default();
        ConnectionPoolConfig {
            min_pool_size: defaults.min_pool_size,
            max_pool_size: defaults.max_pool_size,
            connection_timeout: Duration::from_millis(defaults.connection_timeout_ms),
            queue_timeout: Duration::from_millis(defaults.queue_timeout_ms),
            receive_timeout: Duration::from_millis(defaults.receive_timeout_ms),
            dead_timeout: Duration::from_millis(defaults.dead_timeout_ms),
            linger_enabled: defaults.linger_enabled,
            linger_time: Duration::from_millis(defaults.linger_time_ms),
            enable_tcp_keep_alives: defaults.enable_tcp_keep_alives,
            tcp_keep_alive_time: Duration::from_millis(defaults.tcp_keep_alive_time_ms),
            tcp_keep_alive_interval: Duration::from_millis(defaults.tcp_keep_alive_interval_ms),
            failure_policy: None,
        }
    }
}

impl ConnectionPoolConfig {
    /// Checks the invariants `resolve` enforces, for configs built in code.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_pool_size == 0 {
            return Err(ConfigError::ZeroMaxPoolSize);
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(ConfigError::MinExceedsMax {
                min: self.min_pool_size,
                max: self.max_pool_size,
            });
        }
        for (name, value) in [
            ("connectionTimeout", self.connection_timeout),
            ("queueTimeout", self.queue_timeout),
            ("receiveTimeout", self.receive_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        Ok(())
    }

    /// Socket options applied to every new connection.
    pub fn socket_tuning(&self) -> SocketTuning {
        SocketTuning {
            keepalive: self
                .enable_tcp_keep_alives
                .then_some((self.tcp_keep_alive_time, self.tcp_keep_alive_interval)),
            linger: self.linger_enabled.then_some(self.linger_time),
        }
    }
}

impl fmt::Debug for ConnectionPoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPoolConfig")
            .field("min_pool_size", &self.min_pool_size)
            .field("max_pool_size", &self.max_pool_size)
            .field("connection_timeout", &self.connection_timeout)
            .field("queue_timeout", &self.queue_timeout)
            .field("receive_timeout", &self.receive_timeout)
            .field("dead_timeout", &self.dead_timeout)
            .field("linger_enabled", &self.linger_enabled)
            .field("linger_time", &self.linger_time)
            .field("enable_tcp_keep_alives", &self.enable_tcp_keep_alives)
            .field("tcp_keep_alive_time", &self.tcp_keep_alive_time)
            .field("tcp_keep_alive_interval", &self.tcp_keep_alive_interval)
            .field("failure_policy", &self.failure_policy.is_some())
            .finish()
    }
}

/// Declarative client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// Node addresses, `host:port`.
    pub servers: Vec<String>,
    pub vbucket_count: usize,
    pub operation_timeout_ms: u64,
    pub pool: PoolSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            servers: Vec::new(),
            vbucket_count: DEFAULT_VBUCKET_COUNT,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT.as_millis() as u64,
            pool: PoolSettings::default(),
        }
    }
}

impl ClientConfig {
    /// Parses a JSON document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Per-operation timeout.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Validates the client-level fields and resolves the pool settings.
    pub fn resolve_pool(&self) -> Result<ConnectionPoolConfig, ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::NoServers);
        }
        if self.operation_timeout_ms == 0 {
            return Err(ConfigError::ZeroDuration("operationTimeout"));
        }
        self.pool.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PoolSettings::default().resolve().unwrap();
        assert_eq!(config.min_pool_size, 10);
        assert_eq!(config.max_pool_size, 20);
        assert_eq!(config.queue_timeout, Duration::from_millis(2500));
        assert_eq!(config.dead_timeout, Duration::from_secs(2));
        assert_eq!(config.tcp_keep_alive_time, Duration::from_secs(7200));

        let tuning = config.socket_tuning();
        assert_eq!(tuning.keepalive, Some((Duration::from_secs(7200), Duration::from_secs(1))));
        assert_eq!(tuning.linger, None);
    }

    #[test]
    fn test_min_greater_than_max_is_fatal() {
        let settings = PoolSettings {
            min_pool_size: 20,
            max_pool_size: 10,
            ..PoolSettings::default()
        };
        assert!(matches!(
            settings.resolve(),
            Err(ConfigError::MinExceedsMax { min: 20, max: 10 })
        ));
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let settings = PoolSettings {
            queue_timeout_ms: 0,
            ..PoolSettings::default()
        };
        assert_eq!(
            settings.resolve().unwrap_err(),
            ConfigError::ZeroDuration("queueTimeout")
        );
    }

    #[test]
    fn test_json_with_partial_fields() {
        let config = ClientConfig::from_json(
            r#"{
                "servers": ["127.0.0.1:11210"],
                "pool": {
                    "maxPoolSize": 4,
                    "minPoolSize": 1,
                    "lingerEnabled": true,
                    "failurePolicy": { "type": "throttling", "threshold": 3, "resetAfterMs": 1000 }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.vbucket_count, DEFAULT_VBUCKET_COUNT);
        assert_eq!(
            config.pool.failure_policy,
            FailurePolicySettings::Throttling {
                threshold: 3,
                reset_after_ms: 1000
            }
        );

        let pool = config.resolve_pool().unwrap();
        assert_eq!(pool.max_pool_size, 4);
        assert_eq!(pool.socket_tuning().linger, Some(Duration::from_secs(10)));
        assert!(pool.failure_policy.is_some());
    }

    #[test]
    fn test_client_requires_servers() {
        assert_eq!(
            ClientConfig::default().resolve_pool().unwrap_err(),
            ConfigError::NoServers
        );
    }

    #[test]
    fn test_bad_json_is_parse_error() {
        assert!(matches!(
            ClientConfig::from_json("{ nope"),
            Err(ConfigError::Parse(_))
        ));
    }
}
