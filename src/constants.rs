//! # System Constants
//!
//! Operational defaults for the task worker. Anything an operator may want to
//! tune is exposed through [`crate::config`]; the values here are the
//! fallbacks and the fixed protocol choices.

/// Inbound queue consumed when `WORKER_QUEUE_NAME` is not set
pub const DEFAULT_QUEUE_NAME: &str = "python_task";

/// Fixed delay between connection attempts
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3_000;

/// Unacknowledged deliveries a consumer may hold. Fixed at one: a new task
/// is not delivered until the previous one has been acknowledged.
pub const PREFETCH_COUNT: u16 = 1;

/// Local publish retries before escalating to connection recovery
pub const DEFAULT_PUBLISH_RETRY_ATTEMPTS: u32 = 0;

/// Delay between local publish retries
pub const DEFAULT_PUBLISH_RETRY_DELAY_MS: u64 = 100;

/// Connection name reported to the broker management UI
pub const DEFAULT_CONNECTION_NAME: &str = "task-worker";

/// Broker credentials and vhost used when none are configured
pub mod broker {
    pub const DEFAULT_USERNAME: &str = "guest";
    pub const DEFAULT_PASSWORD: &str = "guest";
    pub const DEFAULT_VHOST: &str = "/";
}

/// Environment variables read at startup
pub mod env {
    pub const BROKER_PREFIX: &str = "RABBITMQ";
    pub const WORKER_PREFIX: &str = "WORKER";
    pub const CONFIG_PATH: &str = "WORKER_CONFIG_PATH";
    pub const HOSTNAME: &str = "HOSTNAME";
    pub const ENVIRONMENT: &str = "WORKER_ENV";
    pub const LOG_FORMAT: &str = "LOG_FORMAT";
}
