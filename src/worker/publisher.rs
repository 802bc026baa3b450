//! # Response Publisher
//!
//! The per-delivery callback: run the handler, publish the correlated
//! response to the caller's reply queue, and only then acknowledge.
//!
//! A delivery is never acknowledged unless its response was handed to the
//! broker. When publishing fails the delivery stays unacknowledged and the
//! error goes back to the consume loop, which rebuilds the channel; the
//! broker then redelivers. Processing is at-least-once.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tracing::warn;

use crate::handler::{error_response, RequestHandler};
use crate::logging::log_delivery_operation;
use crate::messaging::{BrokerChannel, MessagingResult, ResponseEnvelope, TaskEnvelope};

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Response published, then delivery acknowledged
    Acknowledged,
    /// No reply destination; delivery rejected without requeue
    Rejected,
}

/// Publishes handler output back to callers
#[derive(Debug, Clone)]
pub struct ResponsePublisher {
    queue_name: String,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl ResponsePublisher {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            retry_attempts: 0,
            retry_delay: Duration::ZERO,
        }
    }

    /// Retry a failed publish on the same channel before giving up
    pub fn with_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay = delay;
        self
    }

    /// Handle one delivery end to end.
    ///
    /// `Err` means the delivery was left unacknowledged and the channel
    /// should be treated as broken.
    pub async fn process(
        &self,
        channel: &dyn BrokerChannel,
        handler: &dyn RequestHandler,
        envelope: TaskEnvelope,
    ) -> MessagingResult<DeliveryOutcome> {
        let correlation_id = envelope.correlation_id.as_deref();
        log_delivery_operation(
            "receive",
            &self.queue_name,
            envelope.delivery_tag,
            correlation_id,
            "started",
            envelope.redelivered.then_some("redelivered"),
        );

        let payload = invoke(handler, &envelope.payload).await;

        let Some(response) = envelope.respond_with(payload) else {
            warn!(
                queue = %self.queue_name,
                delivery_tag = envelope.delivery_tag,
                "Delivery has no reply destination, rejecting"
            );
            channel.basic_reject(envelope.delivery_tag).await?;
            log_delivery_operation(
                "reject",
                &self.queue_name,
                envelope.delivery_tag,
                correlation_id,
                "rejected",
                Some("missing reply_to"),
            );
            return Ok(DeliveryOutcome::Rejected);
        };

        self.publish(channel, &response).await?;
        log_delivery_operation(
            "publish",
            &self.queue_name,
            envelope.delivery_tag,
            correlation_id,
            "published",
            Some(response.routing_key.as_str()),
        );

        channel.basic_ack(envelope.delivery_tag).await?;
        let latency = format!("latency_ms={}", envelope.elapsed_ms());
        log_delivery_operation(
            "ack",
            &self.queue_name,
            envelope.delivery_tag,
            correlation_id,
            "acknowledged",
            Some(latency.as_str()),
        );
        Ok(DeliveryOutcome::Acknowledged)
    }

    async fn publish(
        &self,
        channel: &dyn BrokerChannel,
        response: &ResponseEnvelope,
    ) -> MessagingResult<()> {
        let mut attempt = 0;
        loop {
            match channel.basic_publish(response).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retry_attempts => {
                    attempt += 1;
                    warn!(
                        routing_key = %response.routing_key,
                        attempt = attempt,
                        max_attempts = self.retry_attempts,
                        error = %e,
                        "Publish failed, retrying on the same channel"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Run the handler, turning a panic into an error-shaped response
async fn invoke(handler: &dyn RequestHandler, payload: &[u8]) -> Vec<u8> {
    match AssertUnwindSafe(handler.handle(payload)).catch_unwind().await {
        Ok(output) => output,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            warn!(handler = %handler.name(), reason = %reason, "Request handler panicked");
            error_response(&format!("handler panicked: {reason}"))
        }
    }
}
