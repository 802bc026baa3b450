//! # Connection Supervisor
//!
//! Owns the single broker connection shared by the worker. The connection is
//! replaced, never repaired: on a confirmed failure the old link is discarded
//! and a new one dialed.
//!
//! Concurrent failure reports are collapsed with a non-blocking guard. The
//! first reporter probes the connection and, if it is dead, reconnects; every
//! other reporter returns [`ReconnectOutcome::AlreadyInProgress`] at once.
//!
//! [`ConnectionSupervisor::close`] is terminal. It interrupts any dial loop in
//! progress, whoever started it, before releasing the connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::messaging::{
    BrokerChannel, BrokerConnector, BrokerLink, MessagingError, MessagingResult,
};

/// What a call to [`ConnectionSupervisor::report_possible_failure`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// Another caller holds the guard and is handling it
    AlreadyInProgress,
    /// The liveness probe succeeded; the connection was kept
    ConnectionHealthy,
    /// The old connection was discarded and a new one installed
    Reconnected,
    /// The supervisor was closed; no connection was installed
    Closed,
}

/// Supervises the broker connection and its replacement
pub struct ConnectionSupervisor {
    connector: Arc<dyn BrokerConnector>,
    current: RwLock<Option<Arc<dyn BrokerLink>>>,
    reconnect_guard: Mutex<()>,
    retry_delay: Duration,
    reconnects: AtomicU64,
    closing: watch::Sender<bool>,
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("endpoint", &self.connector.endpoint())
            .field("connected", &self.is_connected())
            .field("retry_delay", &self.retry_delay)
            .field("reconnects", &self.reconnect_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionSupervisor {
    pub fn new(connector: Arc<dyn BrokerConnector>, retry_delay: Duration) -> Self {
        Self {
            connector,
            current: RwLock::new(None),
            reconnect_guard: Mutex::new(()),
            retry_delay,
            reconnects: AtomicU64::new(0),
            closing: watch::channel(false).0,
        }
    }

    /// Dial until a connection succeeds, then install it as current.
    ///
    /// Retries with the fixed retry delay until connected or closed. Waits
    /// for any reconnect already in progress, and closes a link that is
    /// still installed before dialing.
    pub async fn connect(&self) {
        let _guard = self.reconnect_guard.lock().await;
        self.discard().await;
        self.establish().await;
    }

    /// Called by anyone whose broker operation failed.
    ///
    /// Never blocks on the guard. The connection is only replaced when a
    /// throwaway channel cannot be opened on it.
    pub async fn report_possible_failure(&self) -> ReconnectOutcome {
        let Ok(_guard) = self.reconnect_guard.try_lock() else {
            debug!("Reconnect already in progress, ignoring failure report");
            return ReconnectOutcome::AlreadyInProgress;
        };

        let current = self.current.read().clone();
        if let Some(link) = current {
            if Self::probe(link.as_ref()).await {
                debug!("Liveness probe succeeded, keeping connection");
                return ReconnectOutcome::ConnectionHealthy;
            }
        }

        warn!(
            endpoint = %self.connector.endpoint(),
            "Broker connection unusable, reconnecting"
        );
        self.discard().await;
        if !self.establish().await {
            return ReconnectOutcome::Closed;
        }
        let total = self.reconnects.fetch_add(1, Ordering::SeqCst) + 1;
        info!(reconnects = total, "Broker connection re-established");
        ReconnectOutcome::Reconnected
    }

    /// Wait until no reconnect is in progress
    pub async fn wait_for_reconnect(&self) {
        drop(self.reconnect_guard.lock().await);
    }

    /// New channel on the current connection
    pub async fn get_channel(&self) -> MessagingResult<Box<dyn BrokerChannel>> {
        let link = self
            .current
            .read()
            .clone()
            .ok_or(MessagingError::ConnectionUnavailable)?;
        link.create_channel().await
    }

    pub fn is_connected(&self) -> bool {
        self.current
            .read()
            .as_ref()
            .is_some_and(|link| link.is_connected())
    }

    /// Completed reconnections since startup
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn is_closed(&self) -> bool {
        *self.closing.borrow()
    }

    /// Release the connection on shutdown. Safe to call more than once.
    ///
    /// A dial loop running under the guard is interrupted first, so this
    /// returns even while the broker is unreachable.
    pub async fn close(&self) {
        self.closing.send_replace(true);
        let _guard = self.reconnect_guard.lock().await;
        if self.discard().await {
            info!(endpoint = %self.connector.endpoint(), "Broker connection closed");
        }
    }

    /// Dial until connected. Returns `false` when interrupted by `close`.
    async fn establish(&self) -> bool {
        let endpoint = self.connector.endpoint();
        let mut closing = self.closing.subscribe();
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = closed(&mut closing) => None,
                result = self.connector.connect() => Some(result),
            };
            let Some(result) = result else {
                info!(
                    endpoint = %endpoint,
                    attempt = attempt,
                    "Supervisor closed, dialing stopped"
                );
                return false;
            };
            match result {
                Ok(link) => {
                    *self.current.write() = Some(link);
                    info!(endpoint = %endpoint, attempt = attempt, "Connected to broker");
                    return true;
                }
                Err(e) => {
                    warn!(
                        endpoint = %endpoint,
                        attempt = attempt,
                        retry_in_ms = self.retry_delay.as_millis() as u64,
                        error = %e,
                        "Broker connection attempt failed"
                    );
                    tokio::select! {
                        biased;
                        _ = closed(&mut closing) => {}
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
            }
        }
    }

    /// Take the current link out and close it. Returns whether one existed.
    async fn discard(&self) -> bool {
        let previous = self.current.write().take();
        match previous {
            Some(link) => {
                if let Err(e) = link.close().await {
                    debug!(error = %e, "Ignoring error while closing old connection");
                }
                true
            }
            None => false,
        }
    }

    async fn probe(link: &dyn BrokerLink) -> bool {
        match link.create_channel().await {
            Ok(channel) => {
                if let Err(e) = channel.close().await {
                    debug!(error = %e, "Probe channel close failed");
                }
                true
            }
            Err(e) => {
                debug!(error = %e, "Liveness probe failed");
                false
            }
        }
    }
}

async fn closed(closing: &mut watch::Receiver<bool>) {
    let _ = closing.wait_for(|closed| *closed).await;
}
