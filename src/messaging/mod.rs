//! # Messaging Module
//!
//! Broker-facing types for the task worker: the connector/link/channel seams,
//! the envelopes that cross them, and the providers that implement them.

pub mod broker;
pub mod errors;
pub mod message;
pub mod providers;

pub use broker::{BrokerChannel, BrokerConnector, BrokerLink, DeliveryStream};
pub use errors::{MessagingError, MessagingResult};
pub use message::{ResponseEnvelope, TaskEnvelope, RESPONSE_CONTENT_TYPE};
