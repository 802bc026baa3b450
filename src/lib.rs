#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Scalable Worker
//!
//! A long-running AMQP request/response worker. It consumes task requests
//! from a queue, hands each payload to a pluggable [`handler::RequestHandler`],
//! publishes the correlated response to the caller's reply queue and
//! acknowledges the task only after that publish succeeded.
//!
//! ## Architecture
//!
//! - **Connection supervisor**: one shared connection, dialed with a fixed
//!   retry delay and replaced under a non-blocking guard so concurrent failure
//!   reports collapse into a single reconnect
//! - **Channel session**: queue declaration, prefetch of one, consumer
//! - **Consume loop**: `Consuming`/`Recovering`/`Terminated` state machine;
//!   transport errors trigger recovery, never process exit
//! - **Response publisher**: response-then-ack, at-least-once processing
//!
//! ## Module Organization
//!
//! - [`config`] - environment and file based configuration
//! - [`messaging`] - broker seams, envelopes, RabbitMQ and in-memory providers
//! - [`handler`] - request handler trait and the default echo handler
//! - [`worker`] - supervisor, session, publisher, consume loop, bootstrap
//! - [`logging`] - structured logging setup
//! - [`error`] - top-level error type
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use scalable_worker::config::{BrokerConfig, WorkerConfig};
//! use scalable_worker::handler::EchoTaskHandler;
//! use scalable_worker::messaging::providers::InMemoryBroker;
//! use scalable_worker::worker::TaskWorker;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = InMemoryBroker::new();
//! let config = WorkerConfig::new(BrokerConfig::new("localhost", 5672));
//! let worker = TaskWorker::bootstrap(
//!     config,
//!     Arc::new(broker.connector()),
//!     Arc::new(EchoTaskHandler::new("docs")),
//! )
//! .await?;
//! assert!(worker.supervisor().is_connected());
//! worker.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod handler;
pub mod logging;
pub mod messaging;
pub mod worker;

pub use config::{BrokerConfig, ConfigurationError, WorkerConfig};
pub use error::{WorkerError, WorkerResult};
pub use handler::{EchoTaskHandler, RequestHandler};
pub use messaging::{MessagingError, MessagingResult, ResponseEnvelope, TaskEnvelope};
pub use worker::{
    ConnectionSupervisor, ConsumeLoop, ConsumerState, ReconnectOutcome, ShutdownHandle, TaskWorker,
};
