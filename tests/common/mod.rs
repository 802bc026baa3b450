//! Shared helpers for worker integration tests: a worker running against an
//! in-memory broker, plus polling helpers with a hard timeout.

#![allow(dead_code)]

pub mod strategies;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use scalable_worker::config::{BrokerConfig, WorkerConfig};
use scalable_worker::handler::RequestHandler;
use scalable_worker::messaging::providers::{BrokerEvent, InMemoryBroker, StoredMessage};
use scalable_worker::worker::{ConnectionSupervisor, ConsumerState, ShutdownHandle, TaskWorker};

pub const TASK_QUEUE: &str = "python_task";
pub const REPLY_QUEUE: &str = "amq.gen-reply";
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Worker configuration with a short reconnect delay
pub fn test_config() -> WorkerConfig {
    WorkerConfig::new(BrokerConfig::new("in-memory", 5672))
        .with_reconnect_delay(Duration::from_millis(20))
}

/// A worker whose consume loop runs in a spawned task
pub struct RunningWorker {
    pub shutdown: ShutdownHandle,
    pub state: watch::Receiver<ConsumerState>,
    pub supervisor: Arc<ConnectionSupervisor>,
    handle: JoinHandle<TaskWorker>,
}

impl RunningWorker {
    /// Trigger shutdown, wait for the loop to finish and release the connection
    pub async fn stop(self) -> TaskWorker {
        self.shutdown.trigger();
        let worker = tokio::time::timeout(WAIT_TIMEOUT, self.handle)
            .await
            .expect("worker did not stop in time")
            .expect("worker task panicked");
        worker.close().await;
        worker
    }

    pub async fn wait_for_state(&mut self, target: ConsumerState) {
        tokio::time::timeout(WAIT_TIMEOUT, self.state.wait_for(|s| *s == target))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for state {target}"))
            .expect("state sender dropped");
    }
}

pub async fn start_worker(
    broker: &InMemoryBroker,
    config: WorkerConfig,
    handler: Arc<dyn RequestHandler>,
) -> RunningWorker {
    let mut worker = TaskWorker::bootstrap(config, Arc::new(broker.connector()), handler)
        .await
        .expect("worker bootstrap failed");

    let shutdown = worker.shutdown_handle();
    let state = worker.subscribe_state();
    let supervisor = worker.supervisor();
    let handle = tokio::spawn(async move {
        worker.run().await;
        worker
    });

    RunningWorker {
        shutdown,
        state,
        supervisor,
        handle,
    }
}

/// Collect replies from `queue` until `expected` have arrived
pub async fn wait_for_replies(
    broker: &InMemoryBroker,
    queue: &str,
    expected: usize,
) -> Vec<StoredMessage> {
    let mut replies = Vec::new();
    let finished = tokio::time::timeout(WAIT_TIMEOUT, async {
        loop {
            replies.extend(broker.drain_queue(queue));
            if replies.len() >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    assert!(
        finished.is_ok(),
        "timed out waiting for {expected} replies on {queue}, got {}",
        replies.len()
    );
    replies
}

/// Poll `condition` until it holds
pub async fn eventually<F>(description: &str, condition: F)
where
    F: Fn() -> bool,
{
    let finished = tokio::time::timeout(WAIT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(finished.is_ok(), "timed out waiting for {description}");
}

pub fn acked_count(broker: &InMemoryBroker) -> usize {
    broker
        .events()
        .iter()
        .filter(|e| matches!(e, BrokerEvent::Acked { .. }))
        .count()
}

pub fn task_payload(path: &str, method: &str, query: &str) -> Vec<u8> {
    serde_json::json!({ "path": path, "method": method, "query": query })
        .to_string()
        .into_bytes()
}

/// Handler that takes a while, so overlapping deliveries would be visible
#[derive(Debug)]
pub struct SlowEchoHandler {
    pub delay: Duration,
}

#[async_trait]
impl RequestHandler for SlowEchoHandler {
    async fn handle(&self, payload: &[u8]) -> Vec<u8> {
        tokio::time::sleep(self.delay).await;
        payload.to_vec()
    }

    fn name(&self) -> &str {
        "slow_echo"
    }
}
