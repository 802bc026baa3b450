//! # Worker Core
//!
//! Leaf first:
//!
//! - [`supervisor`] - the shared connection and its guarded replacement
//! - [`session`] - channel, queue declaration, prefetch and consumer
//! - [`publisher`] - handler invocation, correlated reply, ack after publish
//! - [`consumer`] - the consume loop and its recovery state machine
//! - [`bootstrap`] - startup wiring and shutdown

pub mod bootstrap;
pub mod consumer;
pub mod publisher;
pub mod session;
pub mod supervisor;

pub use bootstrap::{ShutdownHandle, TaskWorker};
pub use consumer::{ConsumeLoop, ConsumerState};
pub use publisher::{DeliveryOutcome, ResponsePublisher};
pub use session::ChannelSession;
pub use supervisor::{ConnectionSupervisor, ReconnectOutcome};
