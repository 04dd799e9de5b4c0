//! Exchange configuration.
//!
//! Every field carries a serde default so an absent file, or an entirely
//! unconfigured environment, yields a usable configuration once a namespace is
//! supplied. Sources are applied in order, later ones overriding earlier ones:
//!
//! 1. An optional TOML (or JSON) file
//! 2. Environment variables prefixed `QUEUE_EXCHANGE__` with `__` as the
//!    nesting separator, e.g. `QUEUE_EXCHANGE__RECEIVE__MAX_COUNT=50`
//!
//! The shared key is deliberately not part of this structure. It is read from
//! a CLI flag or the [`SHARED_KEY_ENV`] variable and never written to disk.

use crate::connection::AuthMode;
use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Prefix for configuration environment variables
pub const ENV_PREFIX: &str = "QUEUE_EXCHANGE";

/// Environment variable holding the shared key
pub const SHARED_KEY_ENV: &str = "QUEUE_EXCHANGE_KEY";

/// Largest batch a single transaction unit may carry
pub const MAX_BATCH_LIMIT: usize = 1_000;

/// Largest number of messages one lease receive may return
pub const MAX_LEASE_COUNT: usize = 32;

/// Longest visibility timeout a lease may request (7 days)
pub const MAX_VISIBILITY_SECS: u64 = 7 * 24 * 60 * 60;

/// Top-level exchange configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Broker namespace (first label of the endpoint host)
    pub namespace: String,

    /// Domain appended to the namespace to form the endpoint host
    pub broker_domain: String,

    /// Name of the shared access policy
    pub key_name: String,

    pub auth_mode: AuthMode,

    /// Lifetime of each issued token in seconds
    pub token_validity_secs: u64,

    /// Largest batch accepted by a single transactional send
    pub max_batch_size: usize,

    /// Upper bound for a whole blocking operation in seconds
    pub operation_timeout_secs: u64,

    pub receive: ReceiveSettings,
    pub lease: LeaseSettings,
    pub retry: RetrySettings,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            broker_domain: "servicebus.windows.net".to_string(),
            key_name: "RootManageSharedAccessKey".to_string(),
            auth_mode: AuthMode::SignedToken,
            token_validity_secs: 604_800,
            max_batch_size: 100,
            operation_timeout_secs: 120,
            receive: ReceiveSettings::default(),
            lease: LeaseSettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

/// Peek-lock receive defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveSettings {
    pub max_count: usize,
    pub wait_timeout_secs: u64,
}

impl Default for ReceiveSettings {
    fn default() -> Self {
        Self {
            max_count: 100,
            wait_timeout_secs: 30,
        }
    }
}

impl ReceiveSettings {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

/// Lease queue defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseSettings {
    pub visibility_timeout_secs: u64,
    pub wait_timeout_secs: u64,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 30,
            wait_timeout_secs: 50,
        }
    }
}

impl LeaseSettings {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

/// Connection retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl ExchangeConfig {
    /// Load from an optional file plus `QUEUE_EXCHANGE__*` environment variables
    ///
    /// The result is not validated; call [`ExchangeConfig::validate`] once any
    /// command-line overrides have been applied.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        settings
            .try_deserialize()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })
    }

    /// Check ranges and required values
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.namespace.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "namespace".to_string(),
            });
        }
        if self.broker_domain.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "broker_domain".to_string(),
            });
        }
        if self.key_name.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "key_name".to_string(),
            });
        }
        if self.token_validity_secs == 0 {
            return Err(invalid("token_validity_secs must be at least 1"));
        }
        if self.max_batch_size == 0 || self.max_batch_size > MAX_BATCH_LIMIT {
            return Err(invalid(&format!(
                "max_batch_size must be between 1 and {}",
                MAX_BATCH_LIMIT
            )));
        }
        if self.operation_timeout_secs == 0 {
            return Err(invalid("operation_timeout_secs must be at least 1"));
        }
        if self.receive.max_count == 0 || self.receive.max_count > MAX_BATCH_LIMIT {
            return Err(invalid(&format!(
                "receive.max_count must be between 1 and {}",
                MAX_BATCH_LIMIT
            )));
        }
        if self.lease.visibility_timeout_secs == 0
            || self.lease.visibility_timeout_secs > MAX_VISIBILITY_SECS
        {
            return Err(invalid(&format!(
                "lease.visibility_timeout_secs must be between 1 and {}",
                MAX_VISIBILITY_SECS
            )));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(invalid("retry.backoff_multiplier must be at least 1.0"));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(invalid(
                "retry.initial_delay_ms must not exceed retry.max_delay_ms",
            ));
        }

        Ok(())
    }

    pub fn token_validity(&self) -> Duration {
        Duration::from_secs(self.token_validity_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Endpoint host: `<namespace>.<broker_domain>`
    pub fn endpoint(&self) -> String {
        format!("{}.{}", self.namespace, self.broker_domain)
    }
}

fn invalid(message: &str) -> ConfigurationError {
    ConfigurationError::Invalid {
        message: message.to_string(),
    }
}
