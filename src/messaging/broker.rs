//! # Broker Abstraction
//!
//! The three seams between the worker core and a concrete broker client:
//!
//! - [`BrokerConnector`] dials a new connection (one attempt, no retry)
//! - [`BrokerLink`] is one live connection and hands out channels
//! - [`BrokerChannel`] is one AMQP-style channel: declare, qos, consume,
//!   publish, ack
//!
//! Retry, liveness probing and recovery live in the worker layer; providers
//! only report what happened.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::messaging::errors::MessagingResult;
use crate::messaging::message::{ResponseEnvelope, TaskEnvelope};

/// Stream of deliveries for one consumer. Ends when the broker cancels the
/// consumer; yields `Err` when the channel or connection fails.
pub type DeliveryStream = BoxStream<'static, MessagingResult<TaskEnvelope>>;

/// Factory for broker connections
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Make a single connection attempt
    async fn connect(&self) -> MessagingResult<Arc<dyn BrokerLink>>;

    /// Human-readable target for logging (never includes credentials)
    fn endpoint(&self) -> String;
}

/// One live transport connection
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Open a new channel on this connection
    async fn create_channel(&self) -> MessagingResult<Box<dyn BrokerChannel>>;

    /// Whether the client still considers the connection open
    fn is_connected(&self) -> bool;

    /// Close the connection. Errors are returned for logging only.
    async fn close(&self) -> MessagingResult<()>;
}

/// One channel on a [`BrokerLink`]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a queue, creating it if absent
    async fn queue_declare(&self, queue_name: &str) -> MessagingResult<()>;

    /// Limit the number of unacknowledged deliveries per consumer
    async fn basic_qos(&self, prefetch_count: u16) -> MessagingResult<()>;

    /// Start consuming with manual acknowledgment
    async fn basic_consume(&self, queue_name: &str) -> MessagingResult<DeliveryStream>;

    /// Publish to the default exchange, routed by `response.routing_key`
    async fn basic_publish(&self, response: &ResponseEnvelope) -> MessagingResult<()>;

    /// Acknowledge exactly one delivery
    async fn basic_ack(&self, delivery_tag: u64) -> MessagingResult<()>;

    /// Reject one delivery without requeueing it
    async fn basic_reject(&self, delivery_tag: u64) -> MessagingResult<()>;

    /// Close the channel; the broker requeues its unacknowledged deliveries
    async fn close(&self) -> MessagingResult<()>;
}
