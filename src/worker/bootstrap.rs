//! # Worker Bootstrap
//!
//! Wires configuration, connector and handler into a running worker:
//! connect (retrying forever), initialize the first session, then hand off to
//! the consume loop until shutdown is signalled.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use scalable_worker::config::WorkerConfig;
//! use scalable_worker::handler::EchoTaskHandler;
//! use scalable_worker::messaging::providers::RabbitMqConnector;
//! use scalable_worker::worker::TaskWorker;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = WorkerConfig::from_env()?;
//! let connector = Arc::new(RabbitMqConnector::new(&config.broker, &config.connection_name));
//! let handler = Arc::new(EchoTaskHandler::from_env());
//! let mut worker = TaskWorker::bootstrap(config, connector, handler).await?;
//!
//! let shutdown = worker.shutdown_handle();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     shutdown.trigger();
//! });
//!
//! worker.run().await;
//! worker.close().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::handler::RequestHandler;
use crate::messaging::BrokerConnector;
use crate::worker::consumer::{ConsumeLoop, ConsumerState};
use crate::worker::publisher::ResponsePublisher;
use crate::worker::session::ChannelSession;
use crate::worker::supervisor::ConnectionSupervisor;

/// Requests a cooperative shutdown of a [`TaskWorker`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }
}

/// A bootstrapped worker: connected, subscribed and ready to run
#[derive(Debug)]
pub struct TaskWorker {
    config: WorkerConfig,
    supervisor: Arc<ConnectionSupervisor>,
    consume_loop: ConsumeLoop,
    shutdown: Arc<watch::Sender<bool>>,
}

impl TaskWorker {
    /// Connect and initialize the first session.
    ///
    /// Blocks until the broker is reachable. Fails if the configuration is
    /// invalid or the first session cannot be initialized.
    pub async fn bootstrap(
        config: WorkerConfig,
        connector: Arc<dyn BrokerConnector>,
        handler: Arc<dyn RequestHandler>,
    ) -> WorkerResult<Self> {
        config.validate()?;
        info!(
            endpoint = %connector.endpoint(),
            queue = %config.queue_name,
            handler = %handler.name(),
            "Bootstrapping task worker"
        );

        let supervisor = Arc::new(ConnectionSupervisor::new(connector, config.reconnect_delay()));
        supervisor.connect().await;

        let mut session = ChannelSession::new(supervisor.clone());
        if !session.initialize(&config.queue_name, handler.clone()).await {
            supervisor.close().await;
            return Err(WorkerError::initialization(&config.queue_name));
        }

        let publisher = ResponsePublisher::new(config.queue_name.clone())
            .with_retries(config.publish_retry_attempts, config.publish_retry_delay());
        let consume_loop = ConsumeLoop::new(
            supervisor.clone(),
            session,
            publisher,
            config.queue_name.clone(),
            handler,
        );
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            supervisor,
            consume_loop,
            shutdown: Arc::new(shutdown),
        })
    }

    /// Consume until shutdown is triggered
    pub async fn run(&mut self) {
        let shutdown = self.shutdown.subscribe();
        self.consume_loop.run(shutdown).await;
    }

    /// Release the broker connection
    pub async fn close(&self) {
        self.supervisor.close().await;
        info!(queue = %self.config.queue_name, "Task worker stopped");
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            sender: self.shutdown.clone(),
        }
    }

    pub fn supervisor(&self) -> Arc<ConnectionSupervisor> {
        self.supervisor.clone()
    }

    pub fn state(&self) -> ConsumerState {
        self.consume_loop.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.consume_loop.subscribe_state()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }
}
