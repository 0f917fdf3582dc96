//! ==============================================================================
//! transport.rs - message bus abstraction
//! ==============================================================================
//!
//! purpose:
//!     provides a unified interface for the publish/subscribe bus.
//!     publishers and subscribers only ever talk to `Transport`; what sits
//!     behind it (an mqtt client, a test double) is the caller's choice.
//!
//! event delivery:
//!     a transport owns one background delivery loop. connect acks,
//!     disconnect notices and inbound messages are handed to the registered
//!     `TransportEvents` one at a time, in arrival order, from that loop.
//!     handlers never run concurrently with each other.
//!
//! relationships:
//!     - used by: lifecycle.rs, publisher.rs, subscriber.rs
//!     - implemented by: LoopbackClient (below)
//!
//! ==============================================================================

use crate::error::{Result, TelemetryError};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// connect ack code for an accepted connection
pub const CONNACK_ACCEPTED: u8 = 0;

/// where to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub keepalive: Duration,
}

impl Default for BrokerEndpoint {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            keepalive: Duration::from_secs(60),
        }
    }
}

impl std::fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// what a component wants to hear from the transport
pub trait TransportEvents: Send + Sync {
    fn handle_connect(&self, code: u8);
    fn handle_disconnect(&self, code: u8);
    fn handle_message(&self, _topic: &str, _payload: &[u8]) {}
}

pub trait Transport: Send + Sync {
    /// install the event sink; replaces any earlier one
    fn register(&self, events: Arc<dyn TransportEvents>);
    /// start connecting; the outcome arrives later through `handle_connect`
    fn connect(&self, endpoint: &BrokerEndpoint) -> Result<()>;
    fn disconnect(&self) -> Result<()>;
    /// fire-and-forget, no delivery ack
    fn publish(&self, topic: &str, body: Vec<u8>) -> Result<()>;
    fn subscribe(&self, filter: &str) -> Result<()>;
    fn unsubscribe(&self, filter: &str) -> Result<()>;
    fn run_background(&self) -> Result<()>;
    /// stop delivering events and drop the registered sink
    fn stop_background(&self);
}

/// mqtt topic filter matching (`+` one level, `#` the rest)
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

// ==============================================================================================
// LOOPBACK IMPLEMENTATION (in-process broker)
// ==============================================================================================
//
// routes published messages between clients of the same process. used by the
// binary to run publishers and the display side by side, and by the tests.
//
//     ┌──────────────┐ publish  ┌────────────────┐  queue  ┌──────────────┐
//     │ client sbc0  │ ───────> │ LoopbackBroker │ ──────> │ client ledm  │
//     └──────────────┘          └────────────────┘         └──────┬───────┘
//                                                                 │ delivery task
//                                                                 ▼
//                                                          TransportEvents

enum Inbound {
    ConnAck(u8),
    Disconnected(u8),
    Message { topic: String, payload: Arc<[u8]> },
}

struct ClientSlot {
    filters: HashSet<String>,
    outbox: mpsc::UnboundedSender<Inbound>,
}

struct BrokerInner {
    clients: HashMap<String, ClientSlot>,
    connack_code: u8,
    reachable: bool,
}

/// shared routing table; clone freely
#[derive(Clone)]
pub struct LoopbackBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl Default for LoopbackBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BrokerInner {
                clients: HashMap::new(),
                connack_code: CONNACK_ACCEPTED,
                reachable: true,
            })),
        }
    }

    /// new client handle attached to this broker
    pub fn client(&self, client_id: impl Into<String>) -> LoopbackClient {
        LoopbackClient::new(self.clone(), client_id)
    }

    /// ack code handed to subsequent connects (0 accepts)
    pub fn set_connack_code(&self, code: u8) {
        self.inner.lock().connack_code = code;
    }

    /// unreachable brokers fail `connect` outright
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.lock().reachable = reachable;
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.inner.lock().clients.contains_key(client_id)
    }

    /// kick a client as if the network dropped; it sees `handle_disconnect(code)`
    pub fn drop_client(&self, client_id: &str, code: u8) -> bool {
        let slot = self.inner.lock().clients.remove(client_id);
        match slot {
            Some(slot) => {
                tracing::debug!("[LOOPBACK] dropping client {} (code {})", client_id, code);
                let _ = slot.outbox.send(Inbound::Disconnected(code));
                true
            }
            None => false,
        }
    }

    fn attach(&self, client_id: &str, outbox: mpsc::UnboundedSender<Inbound>) -> Result<u8> {
        let mut inner = self.inner.lock();
        if !inner.reachable {
            return Err(TelemetryError::Connection("broker unreachable".into()));
        }
        let code = inner.connack_code;
        if code == CONNACK_ACCEPTED {
            // clean session: filters from an earlier connection are gone
            inner.clients.insert(
                client_id.to_string(),
                ClientSlot {
                    filters: HashSet::new(),
                    outbox: outbox.clone(),
                },
            );
        }
        let _ = outbox.send(Inbound::ConnAck(code));
        Ok(code)
    }

    fn detach(&self, client_id: &str) -> bool {
        self.inner.lock().clients.remove(client_id).is_some()
    }

    fn route(&self, topic: &str, body: Vec<u8>) -> usize {
        let payload: Arc<[u8]> = body.into();
        let inner = self.inner.lock();
        let mut delivered = 0;
        for slot in inner.clients.values() {
            if slot.filters.iter().any(|f| topic_matches(f, topic)) {
                let sent = slot.outbox.send(Inbound::Message {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                });
                if sent.is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    fn update_filters(&self, client_id: &str, f: impl FnOnce(&mut HashSet<String>)) -> Result<()> {
        let mut inner = self.inner.lock();
        let slot = inner
            .clients
            .get_mut(client_id)
            .ok_or_else(|| TelemetryError::Connection(format!("client {} is not connected", client_id)))?;
        f(&mut slot.filters);
        Ok(())
    }
}

type EventSink = Arc<Mutex<Option<Arc<dyn TransportEvents>>>>;

pub struct LoopbackClient {
    id: String,
    broker: LoopbackBroker,
    outbox: mpsc::UnboundedSender<Inbound>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    events: EventSink,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackClient {
    pub fn new(broker: LoopbackBroker, client_id: impl Into<String>) -> Self {
        let (outbox, inbox) = mpsc::unbounded_channel();
        Self {
            id: client_id.into(),
            broker,
            outbox,
            inbox: Mutex::new(Some(inbox)),
            events: Arc::new(Mutex::new(None)),
            task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn require_connected(&self) -> Result<()> {
        if self.broker.is_connected(&self.id) {
            Ok(())
        } else {
            Err(TelemetryError::Connection(format!("client {} is not connected", self.id)))
        }
    }
}

async fn deliver(mut inbox: mpsc::UnboundedReceiver<Inbound>, events: EventSink) {
    while let Some(event) = inbox.recv().await {
        // clone out so the handler runs without the sink lock held
        let Some(sink) = events.lock().clone() else {
            continue;
        };
        match event {
            Inbound::ConnAck(code) => sink.handle_connect(code),
            Inbound::Disconnected(code) => sink.handle_disconnect(code),
            Inbound::Message { topic, payload } => sink.handle_message(&topic, &payload),
        }
    }
}

impl Transport for LoopbackClient {
    fn register(&self, events: Arc<dyn TransportEvents>) {
        *self.events.lock() = Some(events);
    }

    fn connect(&self, endpoint: &BrokerEndpoint) -> Result<()> {
        tracing::debug!(
            "[LOOPBACK] {} connecting to {} (keepalive {}s)",
            self.id,
            endpoint,
            endpoint.keepalive.as_secs()
        );
        self.broker
            .attach(&self.id, self.outbox.clone())
            .map_err(|e| TelemetryError::Connection(format!("{} at {}", e, endpoint)))?;
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        if self.broker.detach(&self.id) {
            Ok(())
        } else {
            Err(TelemetryError::Connection(format!("client {} is not connected", self.id)))
        }
    }

    fn publish(&self, topic: &str, body: Vec<u8>) -> Result<()> {
        self.require_connected()?;
        let delivered = self.broker.route(topic, body);
        tracing::trace!("[LOOPBACK] {} -> {} ({} receivers)", self.id, topic, delivered);
        Ok(())
    }

    fn subscribe(&self, filter: &str) -> Result<()> {
        self.broker.update_filters(&self.id, |filters| {
            filters.insert(filter.to_string());
        })
    }

    fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.broker.update_filters(&self.id, |filters| {
            filters.remove(filter);
        })
    }

    fn run_background(&self) -> Result<()> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Ok(());
        }
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| TelemetryError::Connection("no async runtime to run the delivery loop".into()))?;
        let inbox = self
            .inbox
            .lock()
            .take()
            .ok_or_else(|| TelemetryError::Connection("delivery loop already shut down".into()))?;
        *task = Some(handle.spawn(deliver(inbox, self.events.clone())));
        Ok(())
    }

    fn stop_background(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.events.lock().take();
        // an accepted connect may never have been acknowledged upstream
        self.broker.detach(&self.id);
    }
}

impl Drop for LoopbackClient {
    fn drop(&mut self) {
        self.broker.detach(&self.id);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
        messages: AtomicUsize,
    }

    impl TransportEvents for Recorder {
        fn handle_connect(&self, code: u8) {
            self.log.lock().push(format!("connect {}", code));
        }

        fn handle_disconnect(&self, code: u8) {
            self.log.lock().push(format!("disconnect {}", code));
        }

        fn handle_message(&self, topic: &str, payload: &[u8]) {
            self.messages.fetch_add(1, Ordering::SeqCst);
            self.log
                .lock()
                .push(format!("{} {}", topic, String::from_utf8_lossy(payload)));
        }
    }

    #[test]
    fn test_topic_filters() {
        assert!(topic_matches("sbc0/measurements", "sbc0/measurements"));
        assert!(!topic_matches("sbc0/measurements", "sbc1/measurements"));
        assert!(topic_matches("+/measurements", "sbc1/measurements"));
        assert!(!topic_matches("+/measurements", "sbc1/x/measurements"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(topic_matches("sbc0/#", "sbc0"));
        assert!(topic_matches("sbc0/#", "sbc0/owb0/ts1"));
        assert!(!topic_matches("sbc0/+", "sbc0"));
        assert!(!topic_matches("sbc0", "sbc0/measurements"));
    }

    #[tokio::test]
    async fn test_events_are_delivered_in_order() {
        let broker = LoopbackBroker::new();
        let publisher = broker.client("pub");
        let subscriber = broker.client("sub");
        let recorder = Arc::new(Recorder::default());
        subscriber.register(recorder.clone());

        publisher.connect(&BrokerEndpoint::default()).unwrap();
        subscriber.connect(&BrokerEndpoint::default()).unwrap();
        subscriber.subscribe("+/measurements").unwrap();

        publisher.publish("sbc0/measurements", b"1".to_vec()).unwrap();
        publisher.publish("sbc0/other", b"x".to_vec()).unwrap();
        publisher.publish("sbc1/measurements", b"2".to_vec()).unwrap();

        // queued before the loop runs, delivered once it does
        subscriber.run_background().unwrap();
        while recorder.messages.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            *recorder.log.lock(),
            vec!["connect 0", "sbc0/measurements 1", "sbc1/measurements 2"]
        );
    }

    #[tokio::test]
    async fn test_refused_and_unreachable() {
        let broker = LoopbackBroker::new();
        let client = broker.client("c");

        broker.set_reachable(false);
        assert!(matches!(
            client.connect(&BrokerEndpoint::default()),
            Err(TelemetryError::Connection(_))
        ));

        broker.set_reachable(true);
        broker.set_connack_code(5);
        client.connect(&BrokerEndpoint::default()).unwrap();
        assert!(!broker.is_connected("c"));
        assert!(client.publish("t", Vec::new()).is_err());
        assert!(client.subscribe("t").is_err());
    }

    #[tokio::test]
    async fn test_drop_client_notifies() {
        let broker = LoopbackBroker::new();
        let client = broker.client("c");
        let recorder = Arc::new(Recorder::default());
        client.register(recorder.clone());
        client.connect(&BrokerEndpoint::default()).unwrap();
        client.run_background().unwrap();

        assert!(broker.drop_client("c", 7));
        assert!(!broker.drop_client("c", 7));
        while recorder.log.lock().len() < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*recorder.log.lock(), vec!["connect 0", "disconnect 7"]);
    }

    #[tokio::test]
    async fn test_stop_background_leaves_the_broker() {
        let broker = LoopbackBroker::new();
        let client = broker.client("c");
        client.connect(&BrokerEndpoint::default()).unwrap();
        assert!(broker.is_connected("c"));

        client.stop_background();
        assert!(!broker.is_connected("c"));
        assert!(client.publish("t", Vec::new()).is_err());
    }

    #[test]
    fn test_run_background_needs_runtime() {
        let broker = LoopbackBroker::new();
        let client = broker.client("c");
        assert!(client.run_background().is_err());
    }
}
