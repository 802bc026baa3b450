//! # Channel Session
//!
//! One logical subscription on top of the supervisor's connection: a channel,
//! the declared queue, a prefetch of one and the consumer stream feeding the
//! bound handler. A session built on a dead connection is useless and is
//! rebuilt from scratch by calling [`ChannelSession::initialize`] again.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::constants::PREFETCH_COUNT;
use crate::handler::RequestHandler;
use crate::logging::log_error;
use crate::messaging::{
    BrokerChannel, DeliveryStream, MessagingError, MessagingResult, TaskEnvelope,
};
use crate::worker::supervisor::ConnectionSupervisor;

/// Channel, consumer and handler for one queue
pub struct ChannelSession {
    supervisor: Arc<ConnectionSupervisor>,
    queue_name: Option<String>,
    channel: Option<Box<dyn BrokerChannel>>,
    deliveries: Option<DeliveryStream>,
    handler: Option<Arc<dyn RequestHandler>>,
}

impl std::fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSession")
            .field("queue_name", &self.queue_name)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl ChannelSession {
    pub fn new(supervisor: Arc<ConnectionSupervisor>) -> Self {
        Self {
            supervisor,
            queue_name: None,
            channel: None,
            deliveries: None,
            handler: None,
        }
    }

    /// (Re)build the subscription on `queue_name` and bind `handler`.
    ///
    /// Any channel left from a previous initialization is closed first, which
    /// hands its unacknowledged delivery back to the broker. Failures are
    /// logged and reported as `false`.
    pub async fn initialize(
        &mut self,
        queue_name: &str,
        handler: Arc<dyn RequestHandler>,
    ) -> bool {
        self.close().await;

        match Self::open(&self.supervisor, queue_name).await {
            Ok((channel, deliveries)) => {
                info!(
                    queue = %queue_name,
                    prefetch = PREFETCH_COUNT,
                    handler = %handler.name(),
                    "Channel session initialized"
                );
                self.queue_name = Some(queue_name.to_string());
                self.channel = Some(channel);
                self.deliveries = Some(deliveries);
                self.handler = Some(handler);
                true
            }
            Err(e) => {
                log_error(
                    "channel_session",
                    "initialize",
                    &e.to_string(),
                    Some(queue_name),
                );
                false
            }
        }
    }

    async fn open(
        supervisor: &ConnectionSupervisor,
        queue_name: &str,
    ) -> MessagingResult<(Box<dyn BrokerChannel>, DeliveryStream)> {
        let channel = supervisor.get_channel().await?;
        let deliveries = async {
            channel.queue_declare(queue_name).await?;
            channel.basic_qos(PREFETCH_COUNT).await?;
            channel.basic_consume(queue_name).await
        }
        .await;

        match deliveries {
            Ok(deliveries) => Ok((channel, deliveries)),
            Err(e) => {
                if let Err(close_err) = channel.close().await {
                    debug!(error = %close_err, "Failed to close half-initialized channel");
                }
                Err(e)
            }
        }
    }

    /// Next delivery from the consumer.
    ///
    /// `None` means the broker cancelled the consumer. An uninitialized
    /// session yields [`MessagingError::ConnectionUnavailable`].
    pub async fn next_delivery(&mut self) -> Option<MessagingResult<TaskEnvelope>> {
        match self.deliveries.as_mut() {
            Some(deliveries) => deliveries.next().await,
            None => Some(Err(MessagingError::ConnectionUnavailable)),
        }
    }

    pub fn channel(&self) -> Option<&dyn BrokerChannel> {
        self.channel.as_deref()
    }

    pub fn handler(&self) -> Option<&Arc<dyn RequestHandler>> {
        self.handler.as_ref()
    }

    pub fn queue_name(&self) -> Option<&str> {
        self.queue_name.as_deref()
    }

    pub fn is_ready(&self) -> bool {
        self.channel.is_some() && self.deliveries.is_some()
    }

    /// Drop the consumer and close the channel, if any
    pub async fn close(&mut self) {
        self.deliveries = None;
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                warn!(error = %e, "Failed to close previous channel");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::FnHandler;
    use crate::messaging::providers::InMemoryBroker;
    use std::time::Duration;

    fn echo() -> Arc<dyn RequestHandler> {
        Arc::new(FnHandler::new(|payload: &[u8]| payload.to_vec()))
    }

    async fn connected(broker: &InMemoryBroker) -> Arc<ConnectionSupervisor> {
        let supervisor = Arc::new(ConnectionSupervisor::new(
            Arc::new(broker.connector()),
            Duration::from_millis(10),
        ));
        supervisor.connect().await;
        supervisor
    }

    #[tokio::test]
    async fn test_initialize_declares_queue_and_consumes() {
        let broker = InMemoryBroker::new();
        let supervisor = connected(&broker).await;
        let mut session = ChannelSession::new(supervisor);

        assert!(session.initialize("python_task", echo()).await);
        assert!(session.is_ready());
        assert_eq!(session.queue_name(), Some("python_task"));

        broker.publish_task("python_task", b"hi".to_vec(), "replies", "c-1");
        let delivery = session.next_delivery().await.unwrap().unwrap();
        assert_eq!(delivery.payload, b"hi".to_vec());
    }

    #[tokio::test]
    async fn test_initialize_without_connection_returns_false() {
        let broker = InMemoryBroker::new();
        let supervisor = Arc::new(ConnectionSupervisor::new(
            Arc::new(broker.connector()),
            Duration::from_millis(10),
        ));
        let mut session = ChannelSession::new(supervisor);

        assert!(!session.initialize("python_task", echo()).await);
        assert!(!session.is_ready());
        assert!(matches!(
            session.next_delivery().await,
            Some(Err(MessagingError::ConnectionUnavailable))
        ));
    }

    #[tokio::test]
    async fn test_reinitialize_returns_unacked_delivery() {
        let broker = InMemoryBroker::new();
        let supervisor = connected(&broker).await;
        let mut session = ChannelSession::new(supervisor);
        assert!(session.initialize("python_task", echo()).await);

        broker.publish_task("python_task", b"job".to_vec(), "replies", "c-1");
        let first = session.next_delivery().await.unwrap().unwrap();
        assert!(!first.redelivered);

        assert!(session.initialize("python_task", echo()).await);
        let again = session.next_delivery().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.correlation_id.as_deref(), Some("c-1"));
    }
}
