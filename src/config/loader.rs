//! Configuration Loader
//!
//! Layers defaults, an optional TOML file and environment variables with the
//! `config` crate. The variable set is captured once, so tests can load from
//! an explicit map without touching the process environment.

use std::collections::HashMap;
use std::path::Path;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use tracing::debug;

use super::{BrokerConfig, ConfigResult, WorkerConfig};
use crate::constants::{self, env};

/// Worker settings as they appear in the layered sources
#[derive(Debug, Deserialize)]
struct WorkerSettings {
    queue_name: String,
    reconnect_delay_ms: u64,
    publish_retry_attempts: u32,
    publish_retry_delay_ms: u64,
    connection_name: String,
}

/// Loads [`WorkerConfig`] from a captured set of environment variables
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    vars: HashMap<String, String>,
}

impl ConfigLoader {
    /// Capture the current process environment
    pub fn from_process_env() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Use an explicit variable set instead of the process environment
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// Build, deserialize and validate the configuration.
    ///
    /// Broker and worker settings are built separately, each from the file
    /// and its own variable prefix, so `WORKER_PORT` can never move the
    /// broker and `RABBITMQ_QUEUE_NAME` can never rename the queue.
    pub fn load(&self) -> ConfigResult<WorkerConfig> {
        let broker: BrokerConfig = self
            .with_file(Config::builder())
            .add_source(self.environment(env::BROKER_PREFIX))
            .build()?
            .try_deserialize()?;

        let worker: WorkerSettings = self
            .with_file(
                Config::builder()
                    .set_default("queue_name", constants::DEFAULT_QUEUE_NAME)?
                    .set_default(
                        "reconnect_delay_ms",
                        constants::DEFAULT_RECONNECT_DELAY_MS as i64,
                    )?
                    .set_default(
                        "publish_retry_attempts",
                        i64::from(constants::DEFAULT_PUBLISH_RETRY_ATTEMPTS),
                    )?
                    .set_default(
                        "publish_retry_delay_ms",
                        constants::DEFAULT_PUBLISH_RETRY_DELAY_MS as i64,
                    )?
                    .set_default("connection_name", constants::DEFAULT_CONNECTION_NAME)?,
            )
            .add_source(self.environment(env::WORKER_PREFIX))
            .build()?
            .try_deserialize()?;

        let config = WorkerConfig {
            broker,
            queue_name: worker.queue_name,
            reconnect_delay_ms: worker.reconnect_delay_ms,
            publish_retry_attempts: worker.publish_retry_attempts,
            publish_retry_delay_ms: worker.publish_retry_delay_ms,
            connection_name: worker.connection_name,
        };
        config.validate()?;

        debug!(
            endpoint = %config.broker.endpoint(),
            queue = %config.queue_name,
            reconnect_delay_ms = config.reconnect_delay_ms,
            "Worker configuration loaded"
        );
        Ok(config)
    }

    fn with_file(&self, builder: ConfigBuilder<DefaultState>) -> ConfigBuilder<DefaultState> {
        match self.vars.get(env::CONFIG_PATH) {
            Some(path) => {
                debug!(path = %path, "Loading worker configuration file");
                builder.add_source(File::from(Path::new(path)).required(true))
            }
            None => builder,
        }
    }

    fn environment(&self, prefix: &str) -> Environment {
        Environment::with_prefix(prefix).source(Some(self.vars.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigurationError;
    use std::io::Write;

    #[test]
    fn test_load_minimal_environment() {
        let config =
            ConfigLoader::from_vars([("RABBITMQ_HOST", "rabbitmq"), ("RABBITMQ_PORT", "5672")])
                .load()
                .unwrap();

        assert_eq!(config.broker.host, "rabbitmq");
        assert_eq!(config.broker.port, 5672);
        assert_eq!(config.broker.username, "guest");
        assert_eq!(config.queue_name, "python_task");
        assert_eq!(config.reconnect_delay_ms, 3_000);
    }

    #[test]
    fn test_worker_overrides() {
        let config = ConfigLoader::from_vars([
            ("RABBITMQ_HOST", "rabbitmq"),
            ("RABBITMQ_PORT", "5673"),
            ("RABBITMQ_USERNAME", "svc"),
            ("WORKER_QUEUE_NAME", "rust_task"),
            ("WORKER_RECONNECT_DELAY_MS", "500"),
            ("WORKER_PUBLISH_RETRY_ATTEMPTS", "2"),
        ])
        .load()
        .unwrap();

        assert_eq!(config.broker.port, 5673);
        assert_eq!(config.broker.username, "svc");
        assert_eq!(config.queue_name, "rust_task");
        assert_eq!(config.reconnect_delay_ms, 500);
        assert_eq!(config.publish_retry_attempts, 2);
    }

    #[test]
    fn test_worker_variables_never_reach_broker_settings() {
        let config = ConfigLoader::from_vars([
            ("RABBITMQ_HOST", "rabbitmq"),
            ("RABBITMQ_PORT", "5672"),
            ("RABBITMQ_QUEUE_NAME", "not_the_queue"),
            ("WORKER_HOST", "elsewhere"),
            ("WORKER_PORT", "tcp://10.0.0.7:80"),
            ("WORKER_USERNAME", "intruder"),
            ("WORKER_PASSWORD", "leaked"),
        ])
        .load()
        .unwrap();

        assert_eq!(config.broker.endpoint(), "rabbitmq:5672");
        assert_eq!(config.broker.username, "guest");
        assert_eq!(config.broker.password, "guest");
        assert_eq!(config.queue_name, "python_task");
    }

    #[test]
    fn test_missing_host_is_an_error() {
        let result = ConfigLoader::from_vars([("RABBITMQ_PORT", "5672")]).load();
        assert!(matches!(result, Err(ConfigurationError::Load(_))));
    }

    #[test]
    fn test_missing_port_is_an_error() {
        let result = ConfigLoader::from_vars([("RABBITMQ_HOST", "rabbitmq")]).load();
        assert!(result.is_err());
    }

    #[test]
    fn test_malformed_port_is_an_error() {
        for port in ["not-a-port", "70000", "-1"] {
            let result =
                ConfigLoader::from_vars([("RABBITMQ_HOST", "rabbitmq"), ("RABBITMQ_PORT", port)])
                    .load();
            assert!(result.is_err(), "port {port:?} should be rejected");
        }

        let result =
            ConfigLoader::from_vars([("RABBITMQ_HOST", "rabbitmq"), ("RABBITMQ_PORT", "0")]).load();
        assert!(matches!(result, Err(ConfigurationError::Invalid { .. })));
    }

    #[test]
    fn test_file_source_with_environment_override() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "host = \"from-file\"\nport = 5672").unwrap();
        writeln!(file, "queue_name = \"file_task\"\nreconnect_delay_ms = 1000").unwrap();
        let path = file.path().to_string_lossy().to_string();

        let config = ConfigLoader::from_vars([
            ("WORKER_CONFIG_PATH", path.as_str()),
            ("RABBITMQ_HOST", "from-env"),
        ])
        .load()
        .unwrap();

        assert_eq!(config.broker.host, "from-env");
        assert_eq!(config.broker.port, 5672);
        assert_eq!(config.queue_name, "file_task");
        assert_eq!(config.reconnect_delay_ms, 1_000);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let result = ConfigLoader::from_vars([
            ("WORKER_CONFIG_PATH", "/nonexistent/worker.toml"),
            ("RABBITMQ_HOST", "rabbitmq"),
            ("RABBITMQ_PORT", "5672"),
        ])
        .load();
        assert!(result.is_err());
    }
}
