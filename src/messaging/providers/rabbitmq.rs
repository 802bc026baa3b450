//! # RabbitMQ Provider
//!
//! AMQP 0.9.1 implementation of the broker seams using the `lapin` crate.
//!
//! - **Default exchange**: responses are routed by reply queue name
//! - **Publisher confirms**: enabled on every channel, so a successful
//!   publish means the broker accepted the message
//! - **Manual acks**: consumers never use `no_ack`
//!
//! ## Usage
//!
//! ```ignore
//! use scalable_worker::config::BrokerConfig;
//! use scalable_worker::messaging::providers::RabbitMqConnector;
//! use scalable_worker::messaging::BrokerConnector;
//!
//! # async fn example(config: BrokerConfig) -> Result<(), Box<dyn std::error::Error>> {
//! let connector = RabbitMqConnector::new(&config, "task-worker");
//! let link = connector.connect().await?;
//! let channel = link.create_channel().await?;
//! channel.queue_declare("python_task").await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::debug;

use crate::config::BrokerConfig;
use crate::messaging::broker::{BrokerChannel, BrokerConnector, BrokerLink, DeliveryStream};
use crate::messaging::errors::{MessagingError, MessagingResult};
use crate::messaging::message::{ResponseEnvelope, TaskEnvelope, RESPONSE_CONTENT_TYPE};

const REPLY_SUCCESS: u16 = 200;

/// Dials RabbitMQ using `lapin`
#[derive(Debug, Clone)]
pub struct RabbitMqConnector {
    uri: String,
    endpoint: String,
    connection_name: String,
}

impl RabbitMqConnector {
    pub fn new(config: &BrokerConfig, connection_name: impl Into<String>) -> Self {
        Self {
            uri: config.amqp_uri(),
            endpoint: config.endpoint(),
            connection_name: connection_name.into(),
        }
    }
}

#[async_trait]
impl BrokerConnector for RabbitMqConnector {
    async fn connect(&self) -> MessagingResult<Arc<dyn BrokerLink>> {
        let properties = ConnectionProperties::default()
            .with_connection_name(self.connection_name.clone().into());
        let connection = Connection::connect(&self.uri, properties)
            .await
            .map_err(|e| {
                MessagingError::connection(format!(
                    "RabbitMQ connection to {} failed: {}",
                    self.endpoint, e
                ))
            })?;

        Ok(Arc::new(RabbitMqLink { connection }))
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

/// A live `lapin` connection
pub struct RabbitMqLink {
    connection: Connection,
}

impl std::fmt::Debug for RabbitMqLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RabbitMqLink")
            .field("connected", &self.connection.status().connected())
            .finish()
    }
}

#[async_trait]
impl BrokerLink for RabbitMqLink {
    async fn create_channel(&self) -> MessagingResult<Box<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| MessagingError::channel("create_channel", e.to_string()))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| MessagingError::channel("confirm_select", e.to_string()))?;

        Ok(Box::new(RabbitMqChannel { channel }))
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> MessagingResult<()> {
        self.connection
            .close(REPLY_SUCCESS, "worker shutdown")
            .await
            .map_err(|e| MessagingError::connection(format!("close failed: {e}")))
    }
}

/// One `lapin` channel
#[derive(Debug)]
pub struct RabbitMqChannel {
    channel: Channel,
}

fn delivery_to_envelope(delivery: Delivery) -> TaskEnvelope {
    let reply_to = delivery
        .properties
        .reply_to()
        .as_ref()
        .map(|s| s.as_str().to_string());
    let correlation_id = delivery
        .properties
        .correlation_id()
        .as_ref()
        .map(|s| s.as_str().to_string());

    TaskEnvelope {
        payload: delivery.data,
        delivery_tag: delivery.delivery_tag,
        reply_to,
        correlation_id,
        redelivered: delivery.redelivered,
        received_at: chrono::Utc::now(),
    }
}

#[async_trait]
impl BrokerChannel for RabbitMqChannel {
    async fn queue_declare(&self, queue_name: &str) -> MessagingResult<()> {
        self.channel
            .queue_declare(queue_name, QueueDeclareOptions::default(), FieldTable::default())
            .await
            .map_err(|e| MessagingError::queue_declare(queue_name, e.to_string()))?;
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> MessagingResult<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| MessagingError::channel("basic_qos", e.to_string()))
    }

    async fn basic_consume(&self, queue_name: &str) -> MessagingResult<DeliveryStream> {
        let consumer_tag = format!("task-worker-{}", uuid::Uuid::new_v4());
        let consumer = self
            .channel
            .basic_consume(
                queue_name,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::consume(queue_name, e.to_string()))?;

        debug!(queue = %queue_name, consumer_tag = %consumer_tag, "Consumer registered");

        let queue = queue_name.to_string();
        Ok(consumer
            .map(move |result| {
                result
                    .map(delivery_to_envelope)
                    .map_err(|e| MessagingError::consume(&queue, e.to_string()))
            })
            .boxed())
    }

    async fn basic_publish(&self, response: &ResponseEnvelope) -> MessagingResult<()> {
        let mut properties =
            BasicProperties::default().with_content_type(RESPONSE_CONTENT_TYPE.into());
        if let Some(correlation_id) = &response.correlation_id {
            properties = properties.with_correlation_id(correlation_id.clone().into());
        }

        let confirm = self
            .channel
            .basic_publish(
                "",
                &response.routing_key,
                BasicPublishOptions::default(),
                &response.payload,
                properties,
            )
            .await
            .map_err(|e| MessagingError::publish(&response.routing_key, e.to_string()))?;

        let confirmation = confirm.await.map_err(|e| {
            MessagingError::publish(&response.routing_key, format!("confirmation failed: {e}"))
        })?;

        if confirmation.is_nack() {
            return Err(MessagingError::publish(
                &response.routing_key,
                "broker nacked the publish",
            ));
        }
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> MessagingResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| MessagingError::ack(delivery_tag, e.to_string()))
    }

    async fn basic_reject(&self, delivery_tag: u64) -> MessagingResult<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue: false })
            .await
            .map_err(|e| MessagingError::reject(delivery_tag, e.to_string()))
    }

    async fn close(&self) -> MessagingResult<()> {
        self.channel
            .close(REPLY_SUCCESS, "session rebuilt")
            .await
            .map_err(|e| MessagingError::channel("close", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BrokerConfig {
        BrokerConfig::new("rabbit.internal", 5673)
    }

    #[test]
    fn test_connector_endpoint_hides_credentials() {
        let connector = RabbitMqConnector::new(&test_config(), "task-worker");
        assert_eq!(connector.endpoint(), "rabbit.internal:5673");
        assert!(!connector.endpoint().contains("guest"));
    }

    // Integration tests require RabbitMQ to be running
    // Then: RABBITMQ_HOST=localhost RABBITMQ_PORT=5672 cargo test rabbitmq -- --ignored

    #[tokio::test]
    #[ignore = "requires RabbitMQ running"]
    async fn test_rabbitmq_connect_and_declare() {
        let config = BrokerConfig::from_env().unwrap();
        let connector = RabbitMqConnector::new(&config, "task-worker-test");
        let link = connector.connect().await.unwrap();
        assert!(link.is_connected());

        let channel = link.create_channel().await.unwrap();
        let queue_name = format!("test_declare_{}", uuid::Uuid::new_v4());
        channel.queue_declare(&queue_name).await.unwrap();
        // Idempotent
        channel.queue_declare(&queue_name).await.unwrap();
        channel.basic_qos(1).await.unwrap();

        channel.close().await.unwrap();
        link.close().await.unwrap();
    }
}
