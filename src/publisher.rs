//! ==============================================================================
//! publisher.rs - simulated device publishing waveform telemetry
//! ==============================================================================
//!
//! purpose:
//!     stands in for a single-board computer with one-wire temperature buses.
//!     every interval it samples the waveform, wraps the readings in an
//!     envelope and publishes it to `<device>/measurements`.
//!
//! relationships:
//!     - uses: waveform.rs (table + payloads), lifecycle.rs (connection state)
//!     - talks to: transport.rs (fire-and-forget publish)
//!
//! ==============================================================================

use crate::domain::{Envelope, ValueFormat};
use crate::error::{Result, TelemetryError};
use crate::lifecycle::{ConnectionLifecycle, ConnectionState, DEFAULT_READY_TIMEOUT};
use crate::transport::{BrokerEndpoint, Transport};
use crate::waveform::{SensorLayout, WaveformGenerator};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// upper bound on joining the publish loop during stop
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// topic a device publishes to
pub fn measurements_topic(device: &str) -> String {
    format!("{}/measurements", device)
}

#[derive(Debug, Clone)]
pub struct PublisherOptions {
    pub device: String,
    pub interval_seconds: f64,
    pub cycle_seconds: f64,
    pub amplitude_max: f64,
    pub buses: u32,
    pub sensors_per_bus: u32,
    pub base_offsets: Vec<f64>,
    pub value_format: ValueFormat,
    pub include_timestamp: bool,
    pub ready_timeout: Duration,
}

impl PublisherOptions {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            interval_seconds: 2.0,
            cycle_seconds: 20.0,
            amplitude_max: 0.4,
            buses: 2,
            sensors_per_bus: 8,
            base_offsets: Vec::new(),
            value_format: ValueFormat::Numeric,
            include_timestamp: true,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

/// everything one tick needs; moved into the publish task
#[derive(Clone)]
struct Ticker {
    device: String,
    topic: String,
    generator: Arc<WaveformGenerator>,
    transport: Arc<dyn Transport>,
    include_timestamp: bool,
}

impl Ticker {
    fn envelope(&self, step: usize) -> Envelope {
        let mut envelope = self.generator.payload(step);
        if self.include_timestamp {
            envelope.stamp_now();
        }
        envelope
    }

    /// publish one step; errors stay inside the tick
    fn tick(&self, step: usize) {
        let sent = self
            .envelope(step)
            .to_json()
            .and_then(|body| self.transport.publish(&self.topic, body));
        match sent {
            Ok(()) => debug!("{}: published step {} to {}", self.device, step, self.topic),
            Err(e) => warn!("{}: publish error: {}", self.device, e),
        }
    }
}

async fn publish_loop(ticker: Ticker, interval: Duration, shutdown: CancellationToken) {
    let table = ticker.generator.table().clone();
    let mut step = 0;
    while !shutdown.is_cancelled() {
        ticker.tick(step);
        step = table.next_step(step);

        // sleep with early exit
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

pub struct Publisher {
    ticker: Ticker,
    interval: Duration,
    ready_timeout: Duration,
    lifecycle: Arc<ConnectionLifecycle>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Publisher {
    /// validate options and register with the transport; nothing runs yet
    pub fn new(options: PublisherOptions, endpoint: BrokerEndpoint, transport: Arc<dyn Transport>) -> Result<Self> {
        let layout = SensorLayout::new(options.device.clone(), options.buses, options.sensors_per_bus)
            .with_base_offsets(options.base_offsets);
        let generator = WaveformGenerator::new(
            options.cycle_seconds,
            options.interval_seconds,
            options.amplitude_max,
            layout,
            options.value_format,
        )?;
        let interval = Duration::try_from_secs_f64(options.interval_seconds)
            .map_err(|e| TelemetryError::Configuration(format!("interval: {}", e)))?;

        let lifecycle = Arc::new(ConnectionLifecycle::new(
            format!("{}-sim", options.device),
            endpoint,
            transport.clone(),
        ));
        transport.register(lifecycle.clone());

        Ok(Self {
            ticker: Ticker {
                topic: measurements_topic(&options.device),
                device: options.device,
                generator: Arc::new(generator),
                transport,
                include_timestamp: options.include_timestamp,
            },
            interval,
            ready_timeout: options.ready_timeout,
            lifecycle,
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
        })
    }

    pub fn device(&self) -> &str {
        &self.ticker.device
    }

    pub fn topic(&self) -> &str {
        &self.ticker.topic
    }

    pub fn generator(&self) -> &WaveformGenerator {
        &self.ticker.generator
    }

    pub fn lifecycle(&self) -> &ConnectionLifecycle {
        &self.lifecycle
    }

    /// the envelope the loop would publish at `step` (timestamped if enabled)
    pub fn envelope_for_step(&self, step: usize) -> Envelope {
        self.ticker.envelope(step)
    }

    /// connect (bounded wait), then start the publish loop
    ///
    /// a failed or slow connect does not prevent the loop from starting;
    /// ticks simply fail to publish until the transport recovers.
    pub async fn start(&self) -> ConnectionState {
        if self.shutdown.is_cancelled() {
            warn!("{}: start after stop ignored", self.device());
            return self.lifecycle.state();
        }
        if self.worker.lock().is_some() {
            return self.lifecycle.state();
        }

        self.lifecycle.start();
        let state = self.lifecycle.wait_ready(self.ready_timeout).await;

        let mut worker = self.worker.lock();
        if worker.is_none() && !self.shutdown.is_cancelled() {
            *worker = Some(tokio::spawn(publish_loop(
                self.ticker.clone(),
                self.interval,
                self.shutdown.clone(),
            )));
            info!(
                "{}: started ({}), publishing every {:?} to {}",
                self.device(),
                state,
                self.interval,
                self.topic()
            );
        }
        state
    }

    /// cooperative shutdown; never fails
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            let abort = handle.abort_handle();
            match tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{}: publish loop ended abnormally: {}", self.device(), e),
                Err(_) => {
                    warn!("{}: publish loop did not stop in time, aborting", self.device());
                    abort.abort();
                }
            }
        }
        self.lifecycle.stop();
        info!("{}: stopped", self.device());
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.worker.get_mut().take() {
            handle.abort();
        }
        // releases the transport's hold on the lifecycle
        self.lifecycle.stop();
    }
}
