//! # Broker Providers
//!
//! Concrete implementations of the broker seams.
//!
//! ## Providers
//!
//! - [`RabbitMqConnector`] - RabbitMQ via the lapin crate
//! - [`InMemoryBroker`] - in-process broker for tests and local runs

mod in_memory;
mod rabbitmq;

pub use in_memory::{
    BrokerEvent, InMemoryBroker, InMemoryChannel, InMemoryConnector, InMemoryLink, StoredMessage,
};
pub use rabbitmq::{RabbitMqChannel, RabbitMqConnector, RabbitMqLink};
