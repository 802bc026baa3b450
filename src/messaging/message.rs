//! # Message Envelopes
//!
//! Transport-neutral envelopes for deliveries consumed from the task queue
//! and the correlated responses published back to callers.

use chrono::{DateTime, Utc};

/// Content type attached to every published response
pub const RESPONSE_CONTENT_TYPE: &str = "application/json";

/// One delivery consumed from the task queue.
///
/// `delivery_tag` is only meaningful on the channel that produced the
/// envelope; once that channel is gone the envelope must be dropped, never
/// acknowledged through a newer channel.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEnvelope {
    pub payload: Vec<u8>,
    pub delivery_tag: u64,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub redelivered: bool,
    pub received_at: DateTime<Utc>,
}

impl TaskEnvelope {
    pub fn new(payload: Vec<u8>, delivery_tag: u64) -> Self {
        Self {
            payload,
            delivery_tag,
            reply_to: None,
            correlation_id: None,
            redelivered: false,
            received_at: Utc::now(),
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Milliseconds since the delivery was received
    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.received_at).num_milliseconds().max(0)
    }

    /// Build the response addressed back to this envelope's caller.
    ///
    /// Returns `None` when the caller gave no reply destination.
    pub fn respond_with(&self, payload: Vec<u8>) -> Option<ResponseEnvelope> {
        let routing_key = self.reply_to.as_ref().filter(|r| !r.is_empty())?;
        Some(ResponseEnvelope {
            payload,
            routing_key: routing_key.clone(),
            correlation_id: self.correlation_id.clone(),
        })
    }
}

/// A response published to the default exchange, routed by the caller's
/// reply queue name.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub payload: Vec<u8>,
    pub routing_key: String,
    pub correlation_id: Option<String>,
}
