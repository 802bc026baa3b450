//! # In-Memory Broker
//!
//! Thread-safe in-process broker implementing the broker seams for tests and
//! local development.
//!
//! ## Features
//!
//! - **Prefetch accounting**: a consumer never holds more unacknowledged
//!   deliveries than its channel's qos allows
//! - **Redelivery**: closing a channel or losing a connection requeues its
//!   unacknowledged deliveries at the head of the queue, flagged redelivered
//! - **Event log**: deliveries, publishes, acks and rejects in broker order
//! - **Fault injection**: outages, dropped connections, failed publishes and
//!   slow connects
//!
//! Messages published to a queue nobody declared are kept rather than
//! dropped, so tests can read reply queues without declaring them.
//!
//! # Example
//!
//! ```rust
//! use scalable_worker::messaging::providers::InMemoryBroker;
//! use scalable_worker::messaging::BrokerConnector;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = InMemoryBroker::new();
//! broker.publish_task("python_task", br#"{"path":"/x"}"#.to_vec(), "replies", "c-1");
//!
//! let link = broker.connector().connect().await?;
//! let channel = link.create_channel().await?;
//! channel.basic_qos(1).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::messaging::broker::{BrokerChannel, BrokerConnector, BrokerLink, DeliveryStream};
use crate::messaging::errors::{MessagingError, MessagingResult};
use crate::messaging::message::{ResponseEnvelope, TaskEnvelope};

/// A message sitting in an in-memory queue
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub payload: Vec<u8>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub redelivered: bool,
}

/// Broker-side record of what happened, in order
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Delivered {
        queue: String,
        delivery_tag: u64,
        correlation_id: Option<String>,
        redelivered: bool,
    },
    Published {
        routing_key: String,
        correlation_id: Option<String>,
    },
    Acked {
        delivery_tag: u64,
        correlation_id: Option<String>,
    },
    Rejected {
        delivery_tag: u64,
        correlation_id: Option<String>,
    },
}

#[derive(Debug)]
struct ChannelState {
    link_id: u64,
    generation: u64,
    prefetch: u16,
    next_tag: u64,
    consumer_queue: Option<String>,
    unacked: BTreeMap<u64, StoredMessage>,
}

#[derive(Debug, Default)]
struct BrokerState {
    unavailable: bool,
    generation: u64,
    queues: HashMap<String, VecDeque<StoredMessage>>,
    channels: HashMap<u64, ChannelState>,
    next_channel_id: u64,
    next_link_id: u64,
    events: Vec<BrokerEvent>,
    connect_attempts: u64,
    connections_opened: u64,
    links_open: usize,
    publish_failures_remaining: usize,
    connect_latency: Option<Duration>,
    max_unacked: usize,
}

impl BrokerState {
    fn channel_alive(&self, channel_id: u64) -> bool {
        !self.unavailable
            && self
                .channels
                .get(&channel_id)
                .is_some_and(|c| c.generation == self.generation)
    }

    /// Forget a channel, putting its unacknowledged deliveries back at the
    /// head of their queue in delivery order.
    fn close_channel(&mut self, channel_id: u64) {
        let Some(channel) = self.channels.remove(&channel_id) else {
            return;
        };
        let Some(queue) = channel.consumer_queue else {
            return;
        };
        let target = self.queues.entry(queue).or_default();
        for (_, mut message) in channel.unacked.into_iter().rev() {
            message.redelivered = true;
            target.push_front(message);
        }
    }

    fn try_deliver(
        &mut self,
        channel_id: u64,
        queue: &str,
    ) -> Option<MessagingResult<TaskEnvelope>> {
        if !self.channel_alive(channel_id) {
            return Some(Err(MessagingError::consume(queue, "channel closed")));
        }

        let channel = self.channels.get(&channel_id)?;
        if channel.prefetch > 0 && channel.unacked.len() >= usize::from(channel.prefetch) {
            return None;
        }

        let message = self.queues.get_mut(queue)?.pop_front()?;
        let channel = self.channels.get_mut(&channel_id)?;
        channel.next_tag += 1;
        let delivery_tag = channel.next_tag;
        channel.unacked.insert(delivery_tag, message.clone());
        let held = channel.unacked.len();
        self.max_unacked = self.max_unacked.max(held);

        self.events.push(BrokerEvent::Delivered {
            queue: queue.to_string(),
            delivery_tag,
            correlation_id: message.correlation_id.clone(),
            redelivered: message.redelivered,
        });

        let mut envelope = TaskEnvelope::new(message.payload, delivery_tag)
            .with_redelivered(message.redelivered);
        envelope.reply_to = message.reply_to;
        envelope.correlation_id = message.correlation_id;
        Some(Ok(envelope))
    }
}

#[derive(Debug, Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl BrokerInner {
    fn close_channels_where(&self, predicate: impl Fn(u64, &ChannelState) -> bool) {
        let mut state = self.state.lock();
        let ids: Vec<u64> = state
            .channels
            .iter()
            .filter(|(id, c)| predicate(**id, c))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            state.close_channel(id);
        }
        drop(state);
        self.notify.notify_waiters();
    }
}

/// In-process broker shared by every connection created from it
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector that dials this broker
    pub fn connector(&self) -> InMemoryConnector {
        InMemoryConnector {
            inner: self.inner.clone(),
        }
    }

    /// Enqueue a task the way an RPC caller would
    pub fn publish_task(
        &self,
        queue: &str,
        payload: Vec<u8>,
        reply_to: &str,
        correlation_id: &str,
    ) {
        self.enqueue(
            queue,
            StoredMessage {
                payload,
                reply_to: Some(reply_to.to_string()),
                correlation_id: Some(correlation_id.to_string()),
                redelivered: false,
            },
        );
    }

    /// Enqueue an arbitrary message
    pub fn enqueue(&self, queue: &str, message: StoredMessage) {
        self.inner
            .state
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(message);
        self.inner.notify.notify_waiters();
    }

    /// Remove and return everything currently in `queue`
    pub fn drain_queue(&self, queue: &str) -> Vec<StoredMessage> {
        self.inner
            .state
            .lock()
            .queues
            .get_mut(queue)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    /// Deliveries currently held unacknowledged across all channels
    pub fn unacked_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .channels
            .values()
            .map(|c| c.unacked.len())
            .sum()
    }

    /// Highest number of unacknowledged deliveries any single channel held
    pub fn max_unacked_per_channel(&self) -> usize {
        self.inner.state.lock().max_unacked
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.inner.state.lock().events.clone()
    }

    pub fn connect_attempts(&self) -> u64 {
        self.inner.state.lock().connect_attempts
    }

    pub fn connections_opened(&self) -> u64 {
        self.inner.state.lock().connections_opened
    }

    /// Connections the client has opened and not yet closed
    pub fn open_connections(&self) -> usize {
        self.inner.state.lock().links_open
    }

    /// Channels the broker still tracks
    pub fn open_channels(&self) -> usize {
        self.inner.state.lock().channels.len()
    }

    /// Simulate the broker going down (`false`) or coming back (`true`).
    /// Going down kills every existing connection.
    pub fn set_available(&self, available: bool) {
        self.inner.state.lock().unavailable = !available;
        if !available {
            self.drop_connections();
        }
    }

    /// Kill every existing connection while the broker stays reachable
    pub fn drop_connections(&self) {
        let generation = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.generation
        };
        self.inner.close_channels_where(|_, c| c.generation < generation);
    }

    /// Make the next `count` publishes fail
    pub fn fail_next_publishes(&self, count: usize) {
        self.inner.state.lock().publish_failures_remaining = count;
    }

    /// Delay every connection attempt by `latency`
    pub fn set_connect_latency(&self, latency: Duration) {
        self.inner.state.lock().connect_latency = Some(latency);
    }
}

/// Connector handed to the connection supervisor
#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    inner: Arc<BrokerInner>,
}

#[async_trait]
impl BrokerConnector for InMemoryConnector {
    async fn connect(&self) -> MessagingResult<Arc<dyn BrokerLink>> {
        let latency = {
            let mut state = self.inner.state.lock();
            state.connect_attempts += 1;
            state.connect_latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.inner.state.lock();
        if state.unavailable {
            return Err(MessagingError::connection("connection refused"));
        }
        state.connections_opened += 1;
        state.links_open += 1;
        state.next_link_id += 1;
        Ok(Arc::new(InMemoryLink {
            inner: self.inner.clone(),
            id: state.next_link_id,
            generation: state.generation,
            closed: AtomicBool::new(false),
        }))
    }

    fn endpoint(&self) -> String {
        "in-memory".to_string()
    }
}

/// A connection to an [`InMemoryBroker`]
#[derive(Debug)]
pub struct InMemoryLink {
    inner: Arc<BrokerInner>,
    id: u64,
    generation: u64,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerLink for InMemoryLink {
    async fn create_channel(&self) -> MessagingResult<Box<dyn BrokerChannel>> {
        if !self.is_connected() {
            return Err(MessagingError::connection("connection closed"));
        }
        let mut state = self.inner.state.lock();
        state.next_channel_id += 1;
        let id = state.next_channel_id;
        state.channels.insert(
            id,
            ChannelState {
                link_id: self.id,
                generation: self.generation,
                prefetch: 0,
                next_tag: 0,
                consumer_queue: None,
                unacked: BTreeMap::new(),
            },
        );
        Ok(Box::new(InMemoryChannel {
            inner: self.inner.clone(),
            id,
        }))
    }

    fn is_connected(&self) -> bool {
        let state = self.inner.state.lock();
        !self.closed.load(Ordering::SeqCst)
            && !state.unavailable
            && state.generation == self.generation
    }

    async fn close(&self) -> MessagingResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.inner.state.lock().links_open -= 1;
        }
        let link_id = self.id;
        self.inner.close_channels_where(|_, c| c.link_id == link_id);
        Ok(())
    }
}

/// A channel on an [`InMemoryLink`]
#[derive(Debug)]
pub struct InMemoryChannel {
    inner: Arc<BrokerInner>,
    id: u64,
}

impl InMemoryChannel {
    fn ensure_alive(&self, operation: &str) -> MessagingResult<()> {
        if self.inner.state.lock().channel_alive(self.id) {
            Ok(())
        } else {
            Err(MessagingError::channel(operation, "channel closed"))
        }
    }

    /// Remove a delivery from this channel's unacknowledged set
    fn settle(&self, delivery_tag: u64) -> Option<StoredMessage> {
        let mut state = self.inner.state.lock();
        state.channels.get_mut(&self.id)?.unacked.remove(&delivery_tag)
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn queue_declare(&self, queue_name: &str) -> MessagingResult<()> {
        self.ensure_alive("queue_declare")
            .map_err(|e| MessagingError::queue_declare(queue_name, e.to_string()))?;
        self.inner
            .state
            .lock()
            .queues
            .entry(queue_name.to_string())
            .or_default();
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> MessagingResult<()> {
        self.ensure_alive("basic_qos")?;
        if let Some(channel) = self.inner.state.lock().channels.get_mut(&self.id) {
            channel.prefetch = prefetch_count;
        }
        Ok(())
    }

    async fn basic_consume(&self, queue_name: &str) -> MessagingResult<DeliveryStream> {
        self.ensure_alive("basic_consume")
            .map_err(|e| MessagingError::consume(queue_name, e.to_string()))?;
        {
            let mut state = self.inner.state.lock();
            if !state.queues.contains_key(queue_name) {
                return Err(MessagingError::consume(queue_name, "NOT_FOUND - no queue"));
            }
            if let Some(channel) = state.channels.get_mut(&self.id) {
                channel.consumer_queue = Some(queue_name.to_string());
            }
        }

        let seed = (self.inner.clone(), self.id, queue_name.to_string(), false);
        let stream = futures::stream::unfold(seed, |(inner, channel_id, queue, done)| async move {
            if done {
                return None;
            }
            let outcome = loop {
                let notified = inner.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let attempt = inner.state.lock().try_deliver(channel_id, &queue);
                match attempt {
                    Some(result) => break result,
                    None => notified.await,
                }
            };
            let done = outcome.is_err();
            Some((outcome, (inner, channel_id, queue, done)))
        });
        Ok(stream.boxed())
    }

    async fn basic_publish(&self, response: &ResponseEnvelope) -> MessagingResult<()> {
        self.ensure_alive("basic_publish")
            .map_err(|e| MessagingError::publish(&response.routing_key, e.to_string()))?;

        {
            let mut state = self.inner.state.lock();
            if state.publish_failures_remaining > 0 {
                state.publish_failures_remaining -= 1;
                return Err(MessagingError::publish(
                    &response.routing_key,
                    "injected publish failure",
                ));
            }
            state
                .queues
                .entry(response.routing_key.clone())
                .or_default()
                .push_back(StoredMessage {
                    payload: response.payload.clone(),
                    reply_to: None,
                    correlation_id: response.correlation_id.clone(),
                    redelivered: false,
                });
            state.events.push(BrokerEvent::Published {
                routing_key: response.routing_key.clone(),
                correlation_id: response.correlation_id.clone(),
            });
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> MessagingResult<()> {
        self.ensure_alive("basic_ack")
            .map_err(|e| MessagingError::ack(delivery_tag, e.to_string()))?;
        let message = self
            .settle(delivery_tag)
            .ok_or_else(|| MessagingError::ack(delivery_tag, "unknown delivery tag"))?;

        self.inner.state.lock().events.push(BrokerEvent::Acked {
            delivery_tag,
            correlation_id: message.correlation_id,
        });
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn basic_reject(&self, delivery_tag: u64) -> MessagingResult<()> {
        self.ensure_alive("basic_reject")
            .map_err(|e| MessagingError::reject(delivery_tag, e.to_string()))?;
        let message = self
            .settle(delivery_tag)
            .ok_or_else(|| MessagingError::reject(delivery_tag, "unknown delivery tag"))?;

        self.inner.state.lock().events.push(BrokerEvent::Rejected {
            delivery_tag,
            correlation_id: message.correlation_id,
        });
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> MessagingResult<()> {
        let channel_id = self.id;
        self.inner.close_channels_where(|id, _| id == channel_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn consuming_channel(
        broker: &InMemoryBroker,
        queue: &str,
    ) -> (Arc<dyn BrokerLink>, Box<dyn BrokerChannel>, DeliveryStream) {
        let link = broker.connector().connect().await.unwrap();
        let channel = link.create_channel().await.unwrap();
        channel.queue_declare(queue).await.unwrap();
        channel.basic_qos(1).await.unwrap();
        let stream = channel.basic_consume(queue).await.unwrap();
        (link, channel, stream)
    }

    #[tokio::test]
    async fn test_prefetch_holds_back_second_delivery() {
        let broker = InMemoryBroker::new();
        broker.publish_task("tasks", b"one".to_vec(), "replies", "c-1");
        broker.publish_task("tasks", b"two".to_vec(), "replies", "c-2");

        let (_link, channel, mut stream) = consuming_channel(&broker, "tasks").await;

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.payload, b"one".to_vec());

        let second = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(second.is_err(), "second delivery must wait for the ack");

        channel.basic_ack(first.delivery_tag).await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.correlation_id.as_deref(), Some("c-2"));
        assert_eq!(broker.max_unacked_per_channel(), 1);
    }

    #[tokio::test]
    async fn test_channel_close_requeues_unacked_as_redelivered() {
        let broker = InMemoryBroker::new();
        broker.publish_task("tasks", b"one".to_vec(), "replies", "c-1");

        let (link, channel, mut stream) = consuming_channel(&broker, "tasks").await;
        let delivery = stream.next().await.unwrap().unwrap();
        assert!(!delivery.redelivered);

        channel.close().await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.queue_len("tasks"), 1);

        let channel = link.create_channel().await.unwrap();
        let mut stream = channel.basic_consume("tasks").await.unwrap();
        let again = stream.next().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.correlation_id.as_deref(), Some("c-1"));
    }

    #[tokio::test]
    async fn test_closed_channels_are_forgotten() {
        let broker = InMemoryBroker::new();
        let link = broker.connector().connect().await.unwrap();

        for _ in 0..5 {
            let channel = link.create_channel().await.unwrap();
            channel.close().await.unwrap();
        }
        let _kept = link.create_channel().await.unwrap();
        assert_eq!(broker.open_channels(), 1);

        link.close().await.unwrap();
        link.close().await.unwrap();
        assert_eq!(broker.open_channels(), 0);
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_dropped_connection_ends_stream_with_error() {
        let broker = InMemoryBroker::new();
        let (link, _channel, mut stream) = consuming_channel(&broker, "tasks").await;

        broker.drop_connections();

        assert!(!link.is_connected());
        assert!(matches!(
            stream.next().await,
            Some(Err(MessagingError::Consume { .. }))
        ));
        assert!(stream.next().await.is_none());
        assert!(link.create_channel().await.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_while_unavailable() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);

        let result = broker.connector().connect().await;
        assert!(matches!(result, Err(MessagingError::Connection { .. })));
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(broker.connections_opened(), 0);

        broker.set_available(true);
        assert!(broker.connector().connect().await.is_ok());
        assert_eq!(broker.connections_opened(), 1);
    }

    #[tokio::test]
    async fn test_injected_publish_failure() {
        let broker = InMemoryBroker::new();
        let link = broker.connector().connect().await.unwrap();
        let channel = link.create_channel().await.unwrap();
        let response = ResponseEnvelope {
            payload: b"{}".to_vec(),
            routing_key: "replies".to_string(),
            correlation_id: Some("c-9".to_string()),
        };

        broker.fail_next_publishes(1);
        assert!(channel.basic_publish(&response).await.is_err());
        assert!(channel.basic_publish(&response).await.is_ok());

        let replies = broker.drain_queue("replies");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].correlation_id.as_deref(), Some("c-9"));
    }

    #[tokio::test]
    async fn test_consume_requires_declared_queue() {
        let broker = InMemoryBroker::new();
        let link = broker.connector().connect().await.unwrap();
        let channel = link.create_channel().await.unwrap();
        assert!(channel.basic_consume("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_reject_settles_without_requeue() {
        let broker = InMemoryBroker::new();
        broker.enqueue(
            "tasks",
            StoredMessage {
                payload: b"orphan".to_vec(),
                reply_to: None,
                correlation_id: None,
                redelivered: false,
            },
        );
        let (_link, channel, mut stream) = consuming_channel(&broker, "tasks").await;
        let delivery = stream.next().await.unwrap().unwrap();

        channel.basic_reject(delivery.delivery_tag).await.unwrap();
        channel.close().await.unwrap();

        assert_eq!(broker.queue_len("tasks"), 0);
        assert!(matches!(
            broker.events().last(),
            Some(BrokerEvent::Rejected { .. })
        ));
    }
}
