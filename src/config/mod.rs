//! # Worker Configuration
//!
//! Broker and worker settings for the task worker.
//!
//! ## Sources
//!
//! Loaded by [`ConfigLoader`] using the `config` crate, later sources winning:
//!
//! 1. Built-in defaults (see [`crate::constants`])
//! 2. Optional TOML file named by `WORKER_CONFIG_PATH`
//! 3. `RABBITMQ_*` variables: `HOST`, `PORT`, `USERNAME`, `PASSWORD`, `VHOST`
//! 4. `WORKER_*` variables: `QUEUE_NAME`, `RECONNECT_DELAY_MS`,
//!    `PUBLISH_RETRY_ATTEMPTS`, `PUBLISH_RETRY_DELAY_MS`, `CONNECTION_NAME`
//!
//! Broker fields come only from the file and `RABBITMQ_*`; worker fields
//! only from the file and `WORKER_*`.
//!
//! `RABBITMQ_HOST` and `RABBITMQ_PORT` have no default. Loading fails when
//! either is missing or malformed, and the worker exits before dialing.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use scalable_worker::config::WorkerConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = WorkerConfig::from_env()?;
//! println!("consuming {} from {}", config.queue_name, config.broker.endpoint());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

use crate::constants::{self, broker};

pub use error::ConfigurationError;
pub use loader::ConfigLoader;

/// Result alias for configuration operations
pub type ConfigResult<T> = Result<T, ConfigurationError>;

/// Where and how to reach the broker
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BrokerConfig {
    pub host: String,
    #[serde(deserialize_with = "deserialize_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
}

/// Accept the port as any integer (or numeric string) and range-check it,
/// so an out-of-range value is rejected instead of truncated
fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let value = i64::deserialize(deserializer)?;
    u16::try_from(value)
        .map_err(|_| D::Error::custom(format!("port {value} is outside 0..=65535")))
}

fn default_username() -> String {
    broker::DEFAULT_USERNAME.to_string()
}

fn default_password() -> String {
    broker::DEFAULT_PASSWORD.to_string()
}

fn default_vhost() -> String {
    broker::DEFAULT_VHOST.to_string()
}

impl BrokerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: default_username(),
            password: default_password(),
            vhost: default_vhost(),
        }
    }

    /// Load only the broker section from the process environment
    pub fn from_env() -> ConfigResult<Self> {
        Ok(WorkerConfig::from_env()?.broker)
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    /// Full AMQP URI including credentials. Never log this.
    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.username,
            self.password,
            self.host,
            self.port,
            self.vhost.replace('/', "%2f")
        )
    }

    /// `host:port`, safe for logging
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.host.trim().is_empty() {
            return Err(ConfigurationError::invalid("RABBITMQ_HOST", "cannot be empty"));
        }
        if self.port == 0 {
            return Err(ConfigurationError::invalid("RABBITMQ_PORT", "must be between 1 and 65535"));
        }
        Ok(())
    }
}

/// Complete worker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerConfig {
    pub broker: BrokerConfig,
    pub queue_name: String,
    pub reconnect_delay_ms: u64,
    pub publish_retry_attempts: u32,
    pub publish_retry_delay_ms: u64,
    pub connection_name: String,
}

impl WorkerConfig {
    /// Defaults for everything except the broker address
    pub fn new(broker: BrokerConfig) -> Self {
        Self {
            broker,
            queue_name: constants::DEFAULT_QUEUE_NAME.to_string(),
            reconnect_delay_ms: constants::DEFAULT_RECONNECT_DELAY_MS,
            publish_retry_attempts: constants::DEFAULT_PUBLISH_RETRY_ATTEMPTS,
            publish_retry_delay_ms: constants::DEFAULT_PUBLISH_RETRY_DELAY_MS,
            connection_name: constants::DEFAULT_CONNECTION_NAME.to_string(),
        }
    }

    /// Load from the process environment (and `WORKER_CONFIG_PATH`, if set)
    pub fn from_env() -> ConfigResult<Self> {
        ConfigLoader::from_process_env().load()
    }

    pub fn with_queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_publish_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.publish_retry_attempts = attempts;
        self.publish_retry_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn publish_retry_delay(&self) -> Duration {
        Duration::from_millis(self.publish_retry_delay_ms)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.broker.validate()?;
        if self.queue_name.trim().is_empty() {
            return Err(ConfigurationError::invalid("WORKER_QUEUE_NAME", "cannot be empty"));
        }
        if self.reconnect_delay_ms == 0 {
            return Err(ConfigurationError::invalid(
                "WORKER_RECONNECT_DELAY_MS",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}
