//! ```text
//! ==============================================================================
//! telemetry_sim - simulated sensor telemetry over a pub/sub bus
//! ==============================================================================
//!
//!     WaveformGenerator ─> Publisher ─> Transport ─> Subscriber ─> cache ─> Renderer
//!
//! the publisher side simulates boards with one-wire temperature buses; the
//! subscriber side keeps the last reading per key and draws it on a panel.
//!
//! ==============================================================================
//! ```

pub mod config;
pub mod display;
pub mod domain;
pub mod error;
pub mod lifecycle;
pub mod publisher;
pub mod subscriber;
pub mod transport;
pub mod waveform;

pub use config::Config;
pub use display::{ConsoleSurface, DrawSurface, PanelLayout, Renderer, Rgb, TextPanel};
pub use domain::{Envelope, Measurement, MeasurementValue, SensorKey, ValueFormat};
pub use error::{Result, TelemetryError};
pub use lifecycle::{ConnectionLifecycle, ConnectionState};
pub use publisher::{measurements_topic, Publisher, PublisherOptions};
pub use subscriber::{MeasurementCache, Subscriber, SubscriberOptions};
pub use transport::{BrokerEndpoint, LoopbackBroker, LoopbackClient, Transport, TransportEvents};
pub use waveform::{build_table, payload_for_step, SensorLayout, WaveformGenerator, WaveformTable};
