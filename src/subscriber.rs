//! ```text
//! ==============================================================================
//! subscriber.rs - measurement cache and display subscriber
//! ==============================================================================
//!
//! purpose:
//!     listens on a measurements topic, keeps the last value seen for a
//!     fixed set of sensor keys and redraws the panel after every message.
//!
//! message path (on the transport's delivery loop):
//!
//!     payload ──> Envelope::from_slice ──> cache.apply ──> renderer.render
//!                       │                                        │
//!                   parse error:                              render error:
//!                   log, drop                                 log, carry on
//!
//! relationships:
//!     - uses: lifecycle.rs (connection state), display.rs (Renderer)
//!     - used by: main.rs
//!
//! ==============================================================================
//! ```

use crate::display::Renderer;
use crate::domain::{Envelope, MeasurementValue, SensorKey};
use crate::error::{Result, TelemetryError};
use crate::lifecycle::{ConnectionLifecycle, ConnectionState, DEFAULT_READY_TIMEOUT};
use crate::transport::{BrokerEndpoint, Transport, TransportEvents, CONNACK_ACCEPTED};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// shown for keys that have not been observed yet
pub const PLACEHOLDER: &str = "--";

/// last known value per configured key
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementCache {
    entries: Vec<(SensorKey, Option<MeasurementValue>)>,
    placeholder: String,
}

impl MeasurementCache {
    /// all entries start as the placeholder; duplicate keys are folded
    pub fn new(keys: impl IntoIterator<Item = SensorKey>) -> Self {
        let mut entries: Vec<(SensorKey, Option<MeasurementValue>)> = Vec::new();
        for key in keys {
            if !entries.iter().any(|(k, _)| *k == key) {
                entries.push((key, None));
            }
        }
        Self {
            entries,
            placeholder: PLACEHOLDER.to_string(),
        }
    }

    pub fn with_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.placeholder = placeholder.into();
        self
    }

    /// overwrite entries present in `envelope`; returns how many changed hands
    pub fn apply(&mut self, envelope: &Envelope) -> usize {
        let mut updated = 0;
        for (key, slot) in self.entries.iter_mut() {
            if let Some(value) = envelope.get(key) {
                *slot = Some(value.clone());
                updated += 1;
            }
        }
        updated
    }

    pub fn get(&self, key: &SensorKey) -> Option<&MeasurementValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_ref())
    }

    /// value as shown on the panel, placeholder included
    pub fn display_value(&self, key: &SensorKey) -> Option<String> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| match v {
            Some(value) => value.to_string(),
            None => self.placeholder.clone(),
        })
    }

    pub fn entries(&self) -> impl Iterator<Item = (&SensorKey, Option<&MeasurementValue>)> {
        self.entries.iter().map(|(k, v)| (k, v.as_ref()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &SensorKey> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SubscriberOptions {
    /// client name in logs
    pub name: String,
    pub topic: String,
    pub keys: Vec<SensorKey>,
    pub placeholder: String,
    pub ready_timeout: Duration,
}

impl SubscriberOptions {
    pub fn new(topic: impl Into<String>, keys: Vec<SensorKey>) -> Self {
        Self {
            name: "ledm".to_string(),
            topic: topic.into(),
            keys,
            placeholder: PLACEHOLDER.to_string(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(TelemetryError::Configuration("subscriber topic must not be empty".into()));
        }
        if self.keys.is_empty() {
            return Err(TelemetryError::Configuration(
                "subscriber needs at least one sensor key".into(),
            ));
        }
        Ok(())
    }
}

/// the part the transport calls into
struct SubscriberCore {
    name: String,
    topic: String,
    lifecycle: Arc<ConnectionLifecycle>,
    transport: Weak<dyn Transport>,
    cache: Mutex<MeasurementCache>,
    renderer: Mutex<Box<dyn Renderer>>,
    stopped: AtomicBool,
}

impl SubscriberCore {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// draw the current cache; failures never leave this function
    fn render(&self, cache: &MeasurementCache) {
        let mut renderer = self.renderer.lock();
        // stop() raises the flag before taking this lock to clear
        if self.is_stopped() {
            return;
        }
        match catch_unwind(AssertUnwindSafe(|| renderer.render(cache))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("[{}] render failed: {}", self.name, e),
            Err(_) => error!("[{}] renderer panicked, skipping frame", self.name),
        }
    }

    fn render_current(&self) {
        let cache = self.cache.lock();
        self.render(&cache);
    }

    fn subscribe(&self) -> Result<()> {
        let transport = self
            .transport
            .upgrade()
            .ok_or_else(|| TelemetryError::Connection("transport is gone".into()))?;
        transport.subscribe(&self.topic)
    }
}

impl TransportEvents for SubscriberCore {
    fn handle_connect(&self, code: u8) {
        self.lifecycle.handle_connect(code);
        // the broker forgets filters with the session
        if code == CONNACK_ACCEPTED && !self.is_stopped() {
            match self.subscribe() {
                Ok(()) => info!("[{}] subscribed to {}", self.name, self.topic),
                Err(e) => warn!("[{}] subscribe to {} failed: {}", self.name, self.topic, e),
            }
        }
    }

    fn handle_disconnect(&self, code: u8) {
        self.lifecycle.handle_disconnect(code);
    }

    fn handle_message(&self, topic: &str, payload: &[u8]) {
        if self.is_stopped() {
            return;
        }
        let envelope = match Envelope::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("[{}] dropping message on {}: {}", self.name, topic, e);
                return;
            }
        };

        let mut cache = self.cache.lock();
        let updated = cache.apply(&envelope);
        debug!(
            "[{}] {} -> {} of {} keys updated",
            self.name,
            topic,
            updated,
            cache.len()
        );
        self.render(&cache);
    }
}

pub struct Subscriber {
    core: Arc<SubscriberCore>,
    transport: Arc<dyn Transport>,
    ready_timeout: Duration,
    shutdown: CancellationToken,
}

impl Subscriber {
    pub fn new(
        options: SubscriberOptions,
        endpoint: BrokerEndpoint,
        transport: Arc<dyn Transport>,
        renderer: Box<dyn Renderer>,
    ) -> Result<Self> {
        options.validate()?;

        let lifecycle = Arc::new(ConnectionLifecycle::new(
            options.name.clone(),
            endpoint,
            transport.clone(),
        ));
        let cache = MeasurementCache::new(options.keys).with_placeholder(options.placeholder);
        let core = Arc::new(SubscriberCore {
            name: options.name,
            topic: options.topic,
            lifecycle,
            transport: Arc::downgrade(&transport),
            cache: Mutex::new(cache),
            renderer: Mutex::new(renderer),
            stopped: AtomicBool::new(false),
        });
        transport.register(core.clone());

        Ok(Self {
            core,
            transport,
            ready_timeout: options.ready_timeout,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.core.topic
    }

    pub fn lifecycle(&self) -> &Arc<ConnectionLifecycle> {
        &self.core.lifecycle
    }

    /// copy of the cache as it stands
    pub fn snapshot(&self) -> MeasurementCache {
        self.core.cache.lock().clone()
    }

    /// the event sink this subscriber registered with its transport
    pub fn events(&self) -> Arc<dyn TransportEvents> {
        self.core.clone()
    }

    /// connect, subscribe and draw the placeholder frame
    ///
    /// a broker that is down or slow only degrades the display; the
    /// subscription is retried on the next successful connect ack.
    pub async fn start(&self) -> ConnectionState {
        if self.core.is_stopped() {
            return self.core.lifecycle.state();
        }

        let lifecycle = &self.core.lifecycle;
        lifecycle.start();
        let state = lifecycle.wait_ready(self.ready_timeout).await;

        if state.is_connected() {
            match self.transport.subscribe(&self.core.topic) {
                Ok(()) => debug!("[{}] subscription to {} confirmed", self.core.name, self.core.topic),
                Err(e) => warn!("[{}] subscribe to {} failed: {}", self.core.name, self.core.topic, e),
            }
        } else {
            warn!(
                "[{}] starting without broker ({}), showing placeholders",
                self.core.name, state
            );
        }

        self.core.render_current();
        state
    }

    /// start, then block until `stop` or `shutdown_token` fires
    pub async fn run(&self) -> ConnectionState {
        let state = self.start().await;
        self.shutdown.cancelled().await;
        self.stop();
        state
    }

    /// cancelling this token ends `run`
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// idempotent; teardown errors are logged and swallowed
    pub fn stop(&self) {
        if self.core.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();

        if let Err(e) = self.transport.unsubscribe(&self.core.topic) {
            debug!("[{}] unsubscribe during stop: {}", self.core.name, e);
        }
        self.core.lifecycle.stop();

        let mut renderer = self.core.renderer.lock();
        match catch_unwind(AssertUnwindSafe(|| renderer.clear())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("[{}] clearing display failed: {}", self.core.name, e),
            Err(_) => error!("[{}] renderer panicked while clearing", self.core.name),
        }
        info!("[{}] subscriber stopped", self.core.name);
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        // breaks transport -> core -> lifecycle -> transport
        self.stop();
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ValueFormat;
    use crate::transport::LoopbackBroker;
    use crate::waveform::{SensorLayout, WaveformGenerator};

    #[derive(Default)]
    struct Frames {
        rendered: Vec<Vec<Option<String>>>,
        cleared: usize,
        drawn_after_clear: usize,
    }

    /// records every frame as the values it would show
    #[derive(Clone, Default)]
    struct RecordingRenderer {
        frames: Arc<Mutex<Frames>>,
        fail: Arc<AtomicBool>,
    }

    impl Renderer for RecordingRenderer {
        fn render(&mut self, cache: &MeasurementCache) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TelemetryError::Render("panel unplugged".into()));
            }
            let frame = cache.entries().map(|(_, v)| v.map(|v| v.to_string())).collect();
            let mut frames = self.frames.lock();
            if frames.cleared > 0 {
                frames.drawn_after_clear += 1;
            }
            frames.rendered.push(frame);
            Ok(())
        }

        fn clear(&mut self) -> Result<()> {
            self.frames.lock().cleared += 1;
            Ok(())
        }
    }

    fn key1() -> SensorKey {
        SensorKey::new("sbc0", 0, 0)
    }

    fn key2() -> SensorKey {
        SensorKey::new("sbc0", 0, 1)
    }

    fn subscriber_on(broker: &LoopbackBroker, renderer: RecordingRenderer) -> Subscriber {
        let options = SubscriberOptions::new("sbc0/measurements", vec![key1(), key2()]);
        Subscriber::new(
            options,
            BrokerEndpoint::default(),
            Arc::new(broker.client("ledm")),
            Box::new(renderer),
        )
        .unwrap()
    }

    fn step_payload(step: usize) -> Vec<u8> {
        let generator = WaveformGenerator::new(
            20.0,
            2.0,
            0.4,
            SensorLayout::new("sbc0", 2, 8),
            ValueFormat::Numeric,
        )
        .unwrap();
        generator.payload(step).to_json().unwrap()
    }

    #[test]
    fn test_cache_apply_only_configured_keys() {
        let mut cache = MeasurementCache::new([key1(), key2(), key1()]);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.display_value(&key2()).as_deref(), Some("--"));

        let mut envelope = Envelope::default();
        envelope.push(key1(), MeasurementValue::Number(0.08));
        envelope.push(SensorKey::new("sbc9", 0, 0), MeasurementValue::Number(1.0));
        assert_eq!(cache.apply(&envelope), 1);

        assert_eq!(cache.get(&key1()), Some(&MeasurementValue::Number(0.08)));
        assert_eq!(cache.get(&key2()), None);
        assert_eq!(cache.display_value(&SensorKey::new("sbc9", 0, 0)), None);
        assert_eq!(cache.keys().count(), 2);
    }

    #[test]
    fn test_cache_apply_is_idempotent() {
        let envelope = Envelope::from_slice(&step_payload(3)).unwrap();
        let mut once = MeasurementCache::new([key1(), key2()]);
        once.apply(&envelope);
        let mut twice = once.clone();
        twice.apply(&envelope);
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn test_step_one_renders_once() {
        let broker = LoopbackBroker::new();
        let renderer = RecordingRenderer::default();
        let subscriber = subscriber_on(&broker, renderer.clone());

        assert_eq!(subscriber.start().await, ConnectionState::Connected);
        assert_eq!(renderer.frames.lock().rendered, vec![vec![None, None]]);

        subscriber
            .events()
            .handle_message("sbc0/measurements", &step_payload(1));
        let frames = renderer.frames.lock();
        assert_eq!(frames.rendered.len(), 2);
        assert_eq!(
            frames.rendered[1],
            vec![Some("0.08".to_string()), Some("1.08".to_string())]
        );
        drop(frames);

        assert_eq!(
            subscriber.snapshot().get(&key1()).and_then(|v| v.as_f64()),
            Some(0.08)
        );
        subscriber.stop();
    }

    #[tokio::test]
    async fn test_unseen_key_keeps_placeholder() {
        let broker = LoopbackBroker::new();
        let renderer = RecordingRenderer::default();
        let subscriber = subscriber_on(&broker, renderer.clone());
        subscriber.start().await;

        subscriber
            .events()
            .handle_message("sbc0/measurements", br#"{"sbc0/owb0/ts0": 0.16}"#);
        subscriber
            .events()
            .handle_message("sbc0/measurements", br#"{"sbc0/owb0/ts7": 7.16}"#);

        let snapshot = subscriber.snapshot();
        assert_eq!(snapshot.display_value(&key1()).as_deref(), Some("0.16"));
        assert_eq!(snapshot.display_value(&key2()).as_deref(), Some("--"));
        assert_eq!(renderer.frames.lock().rendered.len(), 3);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let broker = LoopbackBroker::new();
        let renderer = RecordingRenderer::default();
        let subscriber = subscriber_on(&broker, renderer.clone());
        subscriber.start().await;
        let events = subscriber.events();

        events.handle_message("sbc0/measurements", &step_payload(1));
        let before = subscriber.snapshot();

        events.handle_message("sbc0/measurements", b"{not json");
        events.handle_message("sbc0/measurements", b"[0.1, 0.2]");
        assert_eq!(subscriber.snapshot(), before);
        assert_eq!(renderer.frames.lock().rendered.len(), 2);

        // later messages still land
        events.handle_message("sbc0/measurements", &step_payload(2));
        assert_eq!(
            subscriber.snapshot().get(&key1()),
            Some(&MeasurementValue::Number(0.16))
        );
    }

    #[tokio::test]
    async fn test_render_failure_is_not_fatal() {
        let broker = LoopbackBroker::new();
        let renderer = RecordingRenderer::default();
        renderer.fail.store(true, Ordering::SeqCst);
        let subscriber = subscriber_on(&broker, renderer.clone());
        subscriber.start().await;

        let events = subscriber.events();
        events.handle_message("sbc0/measurements", &step_payload(1));
        assert_eq!(
            subscriber.snapshot().get(&key1()),
            Some(&MeasurementValue::Number(0.08))
        );

        renderer.fail.store(false, Ordering::SeqCst);
        events.handle_message("sbc0/measurements", &step_payload(2));
        assert_eq!(renderer.frames.lock().rendered.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_degraded_without_broker() {
        let broker = LoopbackBroker::new();
        broker.set_reachable(false);
        let renderer = RecordingRenderer::default();
        let subscriber = subscriber_on(&broker, renderer.clone());

        assert_eq!(subscriber.start().await, ConnectionState::Disconnected);
        // placeholders still drawn
        assert_eq!(renderer.frames.lock().rendered, vec![vec![None, None]]);

        subscriber.stop();
        assert_eq!(subscriber.lifecycle().state(), ConnectionState::Stopped);
        assert_eq!(renderer.frames.lock().cleared, 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_final() {
        let broker = LoopbackBroker::new();
        let renderer = RecordingRenderer::default();
        let subscriber = subscriber_on(&broker, renderer.clone());
        subscriber.start().await;

        let events = subscriber.events();
        subscriber.stop();
        subscriber.stop();
        assert_eq!(renderer.frames.lock().cleared, 1);
        assert!(!broker.is_connected("ledm"));

        events.handle_message("sbc0/measurements", &step_payload(1));
        assert_eq!(subscriber.snapshot().get(&key1()), None);
        assert_eq!(subscriber.start().await, ConnectionState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_clear_is_last_frame_under_concurrent_delivery() {
        let payload = step_payload(1);
        for _ in 0..200 {
            let broker = LoopbackBroker::new();
            let renderer = RecordingRenderer::default();
            let subscriber = subscriber_on(&broker, renderer.clone());
            subscriber.start().await;

            let events = subscriber.events();
            let body = payload.clone();
            let delivering = std::thread::spawn(move || {
                for _ in 0..200 {
                    events.handle_message("sbc0/measurements", &body);
                }
            });
            // let delivery get going before stopping
            while renderer.frames.lock().rendered.len() < 2 {
                std::thread::yield_now();
            }
            subscriber.stop();
            delivering.join().unwrap();

            let frames = renderer.frames.lock();
            assert_eq!(frames.cleared, 1);
            assert_eq!(frames.drawn_after_clear, 0);
        }
    }

    #[tokio::test]
    async fn test_run_returns_after_shutdown_token() {
        let broker = LoopbackBroker::new();
        let renderer = RecordingRenderer::default();
        let subscriber = Arc::new(subscriber_on(&broker, renderer.clone()));
        let token = subscriber.shutdown_token();

        let running = tokio::spawn({
            let subscriber = subscriber.clone();
            async move { subscriber.run().await }
        });
        while renderer.frames.lock().rendered.is_empty() {
            tokio::task::yield_now().await;
        }
        token.cancel();

        assert_eq!(running.await.unwrap(), ConnectionState::Connected);
        assert_eq!(subscriber.lifecycle().state(), ConnectionState::Stopped);
        assert_eq!(renderer.frames.lock().cleared, 1);
    }

    #[test]
    fn test_options_validation() {
        let broker = LoopbackBroker::new();
        let empty_keys = SubscriberOptions::new("sbc0/measurements", Vec::new());
        assert!(matches!(
            Subscriber::new(
                empty_keys,
                BrokerEndpoint::default(),
                Arc::new(broker.client("a")),
                Box::new(RecordingRenderer::default()),
            ),
            Err(TelemetryError::Configuration(_))
        ));
        let empty_topic = SubscriberOptions::new(" ", vec![key1()]);
        assert!(Subscriber::new(
            empty_topic,
            BrokerEndpoint::default(),
            Arc::new(broker.client("b")),
            Box::new(RecordingRenderer::default()),
        )
        .is_err());
    }
}
