//! ```text
//! ==============================================================================
//! lifecycle.rs - connection state machine
//! ==============================================================================
//!
//! purpose:
//!     tracks where a component stands with its broker and lets the start-up
//!     path wait, bounded, for the first connect ack.
//!
//! states:
//!
//!                 start()          ack 0
//!     Disconnected ──────> Connecting ──────> Connected
//!          ^                   │                │   ^
//!          └───────────────────┘   disconnect   │   │ ack 0
//!          ack != 0 / timeout                   v   │
//!                                           Reconnecting
//!
//!     stop() from anywhere -> Stopped (terminal)
//!
//!     retrying after a drop is the transport's job; this type only mirrors
//!     what the transport reports.
//!
//! threading:
//!     the state lives in a `tokio::sync::watch` channel. transport events
//!     write it from the delivery loop, the controller reads snapshots or
//!     awaits changes.
//!
//! ==============================================================================
//! ```

use crate::transport::{BrokerEndpoint, Transport, TransportEvents, CONNACK_ACCEPTED};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// default bound on `wait_ready`
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

impl ConnectionState {
    /// next state after a connect ack, `None` if the ack changes nothing
    fn on_connect_ack(self, code: u8) -> Option<Self> {
        match (self, code == CONNACK_ACCEPTED) {
            (ConnectionState::Connecting, true) => Some(ConnectionState::Connected),
            (ConnectionState::Connecting, false) => Some(ConnectionState::Disconnected),
            (ConnectionState::Reconnecting, true) => Some(ConnectionState::Connected),
            _ => None,
        }
    }

    fn on_disconnect(self) -> Option<Self> {
        match self {
            ConnectionState::Connected => Some(ConnectionState::Reconnecting),
            ConnectionState::Connecting => Some(ConnectionState::Disconnected),
            _ => None,
        }
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

pub struct ConnectionLifecycle {
    name: String,
    endpoint: BrokerEndpoint,
    transport: Arc<dyn Transport>,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionLifecycle {
    pub fn new(name: impl Into<String>, endpoint: BrokerEndpoint, transport: Arc<dyn Transport>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            name: name.into(),
            endpoint,
            transport,
            state,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// change stream for observers that want every transition
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// apply `step` atomically; returns (from, to) when the state moved
    fn transition(
        &self,
        step: impl FnOnce(ConnectionState) -> Option<ConnectionState>,
    ) -> Option<(ConnectionState, ConnectionState)> {
        let mut moved = None;
        self.state.send_if_modified(|state| match step(*state) {
            Some(next) if next != *state => {
                moved = Some((*state, next));
                *state = next;
                true
            }
            _ => false,
        });
        moved
    }

    /// kick off the connection; no-op unless currently Disconnected
    pub fn start(&self) {
        let begun = self.transition(|s| match s {
            ConnectionState::Disconnected => Some(ConnectionState::Connecting),
            _ => None,
        });
        if begun.is_none() {
            debug!("[{}] start ignored while {}", self.name, self.state());
            return;
        }

        info!("[{}] connecting to {}", self.name, self.endpoint);
        // delivery loop before connect so the ack has a consumer
        let connected = self
            .transport
            .run_background()
            .and_then(|_| self.transport.connect(&self.endpoint));
        if let Err(e) = connected {
            warn!("[{}] {} - continuing without broker", self.name, e);
            self.transition(|s| match s {
                ConnectionState::Connecting => Some(ConnectionState::Disconnected),
                _ => None,
            });
        }
    }

    /// wait for the connect attempt to settle, at most `timeout`
    ///
    /// a timeout counts as a failed attempt: the state drops back to
    /// Disconnected and the caller carries on degraded.
    pub async fn wait_ready(&self, timeout: Duration) -> ConnectionState {
        let mut rx = self.state.subscribe();
        let settled = tokio::time::timeout(timeout, async {
            match rx.wait_for(|s| *s != ConnectionState::Connecting).await {
                Ok(state) => *state,
                Err(_) => ConnectionState::Stopped,
            }
        })
        .await;

        match settled {
            Ok(state) => state,
            Err(_) => {
                warn!(
                    "[{}] no connect ack from {} within {:?}",
                    self.name, self.endpoint, timeout
                );
                self.transition(|s| match s {
                    ConnectionState::Connecting => Some(ConnectionState::Disconnected),
                    _ => None,
                });
                self.state()
            }
        }
    }

    /// terminal; never fails
    pub fn stop(&self) {
        let previous = self.state.send_replace(ConnectionState::Stopped);
        if previous == ConnectionState::Stopped {
            return;
        }
        if matches!(
            previous,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        ) {
            if let Err(e) = self.transport.disconnect() {
                debug!("[{}] disconnect during stop: {}", self.name, e);
            }
        }
        self.transport.stop_background();
        info!("[{}] stopped (was {})", self.name, previous);
    }
}

impl TransportEvents for ConnectionLifecycle {
    fn handle_connect(&self, code: u8) {
        match self.transition(|s| s.on_connect_ack(code)) {
            Some((from, to)) => {
                if to.is_connected() {
                    info!("[{}] connected to {} ({} -> {})", self.name, self.endpoint, from, to);
                } else {
                    warn!("[{}] connect refused rc={}", self.name, code);
                }
            }
            None if code != CONNACK_ACCEPTED => {
                warn!("[{}] connect refused rc={} while {}", self.name, code, self.state());
            }
            None if self.state() == ConnectionState::Disconnected => {
                // the attempt already timed out; state stays Disconnected until the next start()
                warn!(
                    "[{}] late connect ack from {} ignored, state stays disconnected",
                    self.name, self.endpoint
                );
            }
            None => debug!("[{}] connect ack ignored while {}", self.name, self.state()),
        }
    }

    fn handle_disconnect(&self, code: u8) {
        match self.transition(ConnectionState::on_disconnect) {
            Some((_, to)) => warn!("[{}] disconnected rc={}, now {}", self.name, code, to),
            None => debug!("[{}] disconnect rc={} ignored while {}", self.name, code, self.state()),
        }
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackBroker;

    fn lifecycle_on(broker: &LoopbackBroker, id: &str) -> Arc<ConnectionLifecycle> {
        let transport: Arc<dyn Transport> = Arc::new(broker.client(id));
        let lifecycle = Arc::new(ConnectionLifecycle::new(id, BrokerEndpoint::default(), transport.clone()));
        transport.register(lifecycle.clone());
        lifecycle
    }

    #[test]
    fn test_transition_table() {
        use ConnectionState::*;
        assert_eq!(Connecting.on_connect_ack(0), Some(Connected));
        assert_eq!(Connecting.on_connect_ack(5), Some(Disconnected));
        assert_eq!(Reconnecting.on_connect_ack(0), Some(Connected));
        assert_eq!(Reconnecting.on_connect_ack(5), None);
        assert_eq!(Disconnected.on_connect_ack(0), None);
        assert_eq!(Stopped.on_connect_ack(0), None);
        assert_eq!(Connected.on_disconnect(), Some(Reconnecting));
        assert_eq!(Connecting.on_disconnect(), Some(Disconnected));
        assert_eq!(Stopped.on_disconnect(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_and_stops() {
        let broker = LoopbackBroker::new();
        let lifecycle = lifecycle_on(&broker, "sbc0-sim");

        assert_eq!(lifecycle.state(), ConnectionState::Disconnected);
        lifecycle.start();
        assert_eq!(lifecycle.wait_ready(DEFAULT_READY_TIMEOUT).await, ConnectionState::Connected);
        assert!(broker.is_connected("sbc0-sim"));

        // idempotent
        lifecycle.start();
        assert_eq!(lifecycle.state(), ConnectionState::Connected);

        lifecycle.stop();
        assert_eq!(lifecycle.state(), ConnectionState::Stopped);
        assert!(!broker.is_connected("sbc0-sim"));

        // terminal
        lifecycle.start();
        lifecycle.handle_connect(0);
        assert_eq!(lifecycle.state(), ConnectionState::Stopped);
        lifecycle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_connect_degrades() {
        let broker = LoopbackBroker::new();
        broker.set_connack_code(5);
        let lifecycle = lifecycle_on(&broker, "c");

        lifecycle.start();
        assert_eq!(lifecycle.wait_ready(DEFAULT_READY_TIMEOUT).await, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_broker_degrades() {
        let broker = LoopbackBroker::new();
        broker.set_reachable(false);
        let lifecycle = lifecycle_on(&broker, "c");

        lifecycle.start();
        assert_eq!(lifecycle.state(), ConnectionState::Disconnected);
        assert_eq!(lifecycle.wait_ready(DEFAULT_READY_TIMEOUT).await, ConnectionState::Disconnected);
        lifecycle.stop();
        assert_eq!(lifecycle.state(), ConnectionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_timeout_degrades() {
        let broker = LoopbackBroker::new();
        let transport: Arc<dyn Transport> = Arc::new(broker.client("silent"));
        // nobody registered: the ack is never observed
        let lifecycle = ConnectionLifecycle::new("silent", BrokerEndpoint::default(), transport);

        lifecycle.start();
        let started = tokio::time::Instant::now();
        let state = lifecycle.wait_ready(Duration::from_secs(5)).await;
        assert_eq!(state, ConnectionState::Disconnected);
        assert!(started.elapsed() >= Duration::from_secs(5));

        // the ack turns up after the deadline
        lifecycle.handle_connect(0);
        assert_eq!(lifecycle.state(), ConnectionState::Disconnected);

        // the broker had accepted the session; stop must still release it
        assert!(broker.is_connected("silent"));
        lifecycle.stop();
        assert!(!broker.is_connected("silent"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_and_renewed_ack() {
        let broker = LoopbackBroker::new();
        let lifecycle = lifecycle_on(&broker, "c");
        let mut changes = lifecycle.watch();

        lifecycle.start();
        lifecycle.wait_ready(DEFAULT_READY_TIMEOUT).await;

        broker.drop_client("c", 7);
        changes
            .wait_for(|s| *s == ConnectionState::Reconnecting)
            .await
            .unwrap();

        // the transport's own retry
        lifecycle.transport().connect(&BrokerEndpoint::default()).unwrap();
        changes
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        lifecycle.stop();
    }
}
