//! # Consume Loop
//!
//! Pumps deliveries from the channel session into the response publisher and
//! owns the recovery state machine:
//!
//! ```text
//!   Consuming --(stream error, consumer cancel, publish/ack failure)--> Recovering
//!   Recovering --(report_possible_failure + initialize succeed)--> Consuming
//!   Consuming | Recovering --(shutdown signal)--> Terminated
//! ```
//!
//! Errors never terminate the loop; only the shutdown signal does. Each
//! delivery is handled to completion before the next is awaited, so the
//! prefetch of one holds end to end.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::handler::RequestHandler;
use crate::logging::log_error;
use crate::messaging::{MessagingError, MessagingResult, TaskEnvelope};
use crate::worker::publisher::ResponsePublisher;
use crate::worker::session::ChannelSession;
use crate::worker::supervisor::{ConnectionSupervisor, ReconnectOutcome};

/// Recovery state of the consume loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Consuming,
    Recovering,
    Terminated,
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsumerState::Consuming => write!(f, "consuming"),
            ConsumerState::Recovering => write!(f, "recovering"),
            ConsumerState::Terminated => write!(f, "terminated"),
        }
    }
}

enum Step {
    Shutdown,
    Delivery(Option<MessagingResult<TaskEnvelope>>),
}

/// Drives one channel session until shutdown
pub struct ConsumeLoop {
    supervisor: Arc<ConnectionSupervisor>,
    session: ChannelSession,
    publisher: ResponsePublisher,
    queue_name: String,
    /// Bound to the session on every rebuild
    handler: Arc<dyn RequestHandler>,
    recovery_delay: Duration,
    state: watch::Sender<ConsumerState>,
}

impl std::fmt::Debug for ConsumeLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumeLoop")
            .field("queue_name", &self.queue_name)
            .field("state", &self.state())
            .field("recovery_delay", &self.recovery_delay)
            .finish_non_exhaustive()
    }
}

impl ConsumeLoop {
    /// `session` should already be initialized; an uninitialized session is
    /// recovered on the first iteration.
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        session: ChannelSession,
        publisher: ResponsePublisher,
        queue_name: impl Into<String>,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        let recovery_delay = supervisor.retry_delay();
        let (state, _) = watch::channel(ConsumerState::Consuming);
        Self {
            supervisor,
            session,
            publisher,
            queue_name: queue_name.into(),
            handler,
            recovery_delay,
            state,
        }
    }

    /// Delay between failed re-initializations while recovering
    pub fn with_recovery_delay(mut self, delay: Duration) -> Self {
        self.recovery_delay = delay;
        self
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Follow state changes from another task
    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Consume until `shutdown` turns `true` (or its sender is dropped)
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        self.set_state(ConsumerState::Consuming);
        info!(queue = %self.queue_name, "Consume loop started");

        loop {
            let step = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => Step::Shutdown,
                next = self.session.next_delivery() => Step::Delivery(next),
            };

            let failure = match step {
                Step::Shutdown => break,
                Step::Delivery(Some(Ok(envelope))) => match self.dispatch(envelope).await {
                    Ok(()) => continue,
                    Err(e) => e,
                },
                Step::Delivery(Some(Err(e))) => e,
                Step::Delivery(None) => MessagingError::consumer_cancelled(&self.queue_name),
            };

            log_error(
                "consume_loop",
                "consume",
                &failure.to_string(),
                Some(self.queue_name.as_str()),
            );
            warn!(
                queue = %self.queue_name,
                connection_lost = failure.is_connection_loss(),
                "Consumer entering recovery"
            );
            if !self.recover(&mut shutdown).await {
                break;
            }
        }

        self.session.close().await;
        self.set_state(ConsumerState::Terminated);
        info!(queue = %self.queue_name, "Consume loop terminated");
    }

    /// Runs the handler the session was initialized with
    async fn dispatch(&mut self, envelope: TaskEnvelope) -> MessagingResult<()> {
        let (Some(channel), Some(handler)) = (self.session.channel(), self.session.handler())
        else {
            return Err(MessagingError::ConnectionUnavailable);
        };
        self.publisher
            .process(channel, handler.as_ref(), envelope)
            .await
            .map(|_| ())
    }

    /// Reconnect if needed and rebuild the session. Returns `false` when
    /// shutdown was requested first.
    async fn recover(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        self.set_state(ConsumerState::Recovering);
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            let recovered = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => return false,
                recovered = self.try_recover() => recovered,
            };

            if recovered {
                info!(queue = %self.queue_name, attempt = attempt, "Consumer recovered");
                self.set_state(ConsumerState::Consuming);
                return true;
            }

            debug!(
                attempt = attempt,
                retry_in_ms = self.recovery_delay.as_millis() as u64,
                "Session re-initialization failed, retrying"
            );
            tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => return false,
                _ = tokio::time::sleep(self.recovery_delay) => {}
            }
        }
    }

    async fn try_recover(&mut self) -> bool {
        let outcome = self.supervisor.report_possible_failure().await;
        debug!(outcome = ?outcome, "Failure reported to connection supervisor");
        if outcome == ReconnectOutcome::AlreadyInProgress {
            // Wait for the other reconnect to finish instead of racing it
            self.supervisor.wait_for_reconnect().await;
        }
        self.session
            .initialize(&self.queue_name, self.handler.clone())
            .await
    }

    fn set_state(&self, state: ConsumerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Consumer state changed");
        }
    }
}

/// Resolves once shutdown is requested or the sender is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
