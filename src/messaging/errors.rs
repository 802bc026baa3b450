//! # Messaging Error Types
//!
//! Structured error handling for broker operations using thiserror
//! instead of `Box<dyn Error>` patterns.

use thiserror::Error;

/// Broker and transport error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MessagingError {
    #[error("Broker connection error: {message}")]
    Connection { message: String },

    #[error("Broker connection unavailable: no live connection is installed")]
    ConnectionUnavailable,

    #[error("Channel error: {operation}: {message}")]
    Channel { operation: String, message: String },

    #[error("Queue declaration failed: {queue_name}: {message}")]
    QueueDeclare { queue_name: String, message: String },

    #[error("Consumer error: {queue_name}: {message}")]
    Consume { queue_name: String, message: String },

    #[error("Consumer cancelled by broker: {queue_name}")]
    ConsumerCancelled { queue_name: String },

    #[error("Publish failed: routing key {routing_key}: {message}")]
    Publish { routing_key: String, message: String },

    #[error("Acknowledgment failed for delivery {delivery_tag}: {message}")]
    Ack { delivery_tag: u64, message: String },

    #[error("Reject failed for delivery {delivery_tag}: {message}")]
    Reject { delivery_tag: u64, message: String },
}

impl MessagingError {
    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a channel operation error
    pub fn channel(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Channel {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a queue declaration error
    pub fn queue_declare(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QueueDeclare {
            queue_name: queue_name.into(),
            message: message.into(),
        }
    }

    /// Create a consumer error
    pub fn consume(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Consume {
            queue_name: queue_name.into(),
            message: message.into(),
        }
    }

    /// Create a consumer cancellation error
    pub fn consumer_cancelled(queue_name: impl Into<String>) -> Self {
        Self::ConsumerCancelled {
            queue_name: queue_name.into(),
        }
    }

    /// Create a publish error
    pub fn publish(routing_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            routing_key: routing_key.into(),
            message: message.into(),
        }
    }

    /// Create an acknowledgment error
    pub fn ack(delivery_tag: u64, message: impl Into<String>) -> Self {
        Self::Ack {
            delivery_tag,
            message: message.into(),
        }
    }

    /// Create a reject error
    pub fn reject(delivery_tag: u64, message: impl Into<String>) -> Self {
        Self::Reject {
            delivery_tag,
            message: message.into(),
        }
    }

    /// Whether the error means the connection itself is gone, as opposed to a
    /// failure scoped to one channel or one message.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::ConnectionUnavailable)
    }
}

/// Result type alias for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;
