//! ```text
//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `telemetry.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - BrokerConfig: where the bus lives and how long to wait for it.
//!     - LoggingConfig: default log filter when RUST_LOG is unset.
//!     - PublisherConfig: simulated devices and their waveform.
//!     - DisplayConfig: which keys the panel shows and where.
//!
//!     every field has a default, so a file only needs the values it changes.
//!
//! ==============================================================================
//! ```

use crate::display::{PanelLayout, Rgb, YELLOW};
use crate::domain::{SensorKey, ValueFormat};
use crate::error::{Result, TelemetryError};
use crate::lifecycle::DEFAULT_READY_TIMEOUT;
use crate::publisher::{measurements_topic, PublisherOptions};
use crate::subscriber::{SubscriberOptions, PLACEHOLDER};
use crate::transport::BrokerEndpoint;
use crate::waveform::{SensorLayout, WaveformGenerator};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub logging: LoggingConfig,
    pub publisher: PublisherConfig,
    pub display: DisplayConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub keepalive_seconds: u64,
    /// bound on waiting for the first connect ack
    pub connect_timeout_seconds: f64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            keepalive_seconds: 60,
            connect_timeout_seconds: DEFAULT_READY_TIMEOUT.as_secs_f64(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PublisherConfig {
    pub devices: Vec<String>,
    pub interval_seconds: f64,
    pub cycle_seconds: f64,
    pub amplitude_max: f64,
    pub buses: u32,
    pub sensors_per_bus: u32,
    pub base_offsets: Vec<f64>,
    pub value_format: ValueFormat,
    pub include_timestamp: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            devices: vec!["sbc0".to_string(), "sbc1".to_string()],
            interval_seconds: 2.0,
            cycle_seconds: 20.0,
            amplitude_max: 0.4,
            buses: 2,
            sensors_per_bus: 8,
            base_offsets: Vec::new(),
            value_format: ValueFormat::Numeric,
            include_timestamp: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DisplayConfig {
    pub topic: String,
    /// one or two keys; a 64px panel fits two lines
    pub keys: Vec<SensorKey>,
    pub placeholder: String,
    pub x: i32,
    pub first_baseline: i32,
    pub line_spacing: i32,
    pub color: Rgb,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            topic: measurements_topic("sbc0"),
            keys: vec![SensorKey::new("sbc0", 0, 0), SensorKey::new("sbc0", 0, 1)],
            placeholder: PLACEHOLDER.to_string(),
            x: 1,
            first_baseline: 24,
            line_spacing: 24,
            color: YELLOW,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load with default fallback
    pub fn load_or_default() -> Self {
        let paths = [
            PathBuf::from("config").join("telemetry.toml"),
            PathBuf::from("..").join("config").join("telemetry.toml"),
        ];

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        println!("[CONFIG] Warning: Failed to load {}: {}", path.display(), e);
                    }
                }
            }
        }

        println!("[CONFIG] Warning: No config file found - using defaults");
        Self::default()
    }

    /// reject anything the components would refuse at construction
    pub fn validate(&self) -> Result<()> {
        if self.broker.host.trim().is_empty() {
            return Err(TelemetryError::Configuration("broker host must not be empty".into()));
        }
        if self.broker.port == 0 {
            return Err(TelemetryError::Configuration("broker port must not be 0".into()));
        }
        if Duration::try_from_secs_f64(self.broker.connect_timeout_seconds).is_err()
            || self.broker.connect_timeout_seconds <= 0.0
        {
            return Err(TelemetryError::Configuration(format!(
                "connect timeout must be a positive number of seconds (got {})",
                self.broker.connect_timeout_seconds
            )));
        }

        if self.publisher.devices.is_empty() {
            return Err(TelemetryError::Configuration("at least one device is required".into()));
        }
        for device in &self.publisher.devices {
            let p = &self.publisher;
            WaveformGenerator::new(
                p.cycle_seconds,
                p.interval_seconds,
                p.amplitude_max,
                self.layout_for(device),
                p.value_format,
            )?;
        }

        if self.display.topic.trim().is_empty() {
            return Err(TelemetryError::Configuration("display topic must not be empty".into()));
        }
        if !(1..=2).contains(&self.display.keys.len()) {
            return Err(TelemetryError::Configuration(format!(
                "the display shows one or two keys (got {})",
                self.display.keys.len()
            )));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> BrokerEndpoint {
        BrokerEndpoint {
            host: self.broker.host.clone(),
            port: self.broker.port,
            keepalive: Duration::from_secs(self.broker.keepalive_seconds),
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.broker.connect_timeout_seconds).unwrap_or(DEFAULT_READY_TIMEOUT)
    }

    fn layout_for(&self, device: &str) -> SensorLayout {
        SensorLayout::new(device, self.publisher.buses, self.publisher.sensors_per_bus)
            .with_base_offsets(self.publisher.base_offsets.clone())
    }

    pub fn publisher_options(&self, device: &str) -> PublisherOptions {
        let p = &self.publisher;
        PublisherOptions {
            device: device.to_string(),
            interval_seconds: p.interval_seconds,
            cycle_seconds: p.cycle_seconds,
            amplitude_max: p.amplitude_max,
            buses: p.buses,
            sensors_per_bus: p.sensors_per_bus,
            base_offsets: p.base_offsets.clone(),
            value_format: p.value_format,
            include_timestamp: p.include_timestamp,
            ready_timeout: self.ready_timeout(),
        }
    }

    pub fn subscriber_options(&self) -> SubscriberOptions {
        let mut options = SubscriberOptions::new(self.display.topic.clone(), self.display.keys.clone());
        options.placeholder = self.display.placeholder.clone();
        options.ready_timeout = self.ready_timeout();
        options
    }

    pub fn panel_layout(&self) -> PanelLayout {
        PanelLayout {
            x: self.display.x,
            first_baseline: self.display.first_baseline,
            line_spacing: self.display.line_spacing,
            color: self.display.color,
        }
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        let keys: Vec<&str> = self.display.keys.iter().map(|k| k.as_str()).collect();
        println!("┌─────────────────────────────────────────┐");
        println!("│        TELEMETRY CONFIGURATION          │");
        println!("├─────────────────────────────────────────┤");
        println!("│ Broker: {}:{}", self.broker.host, self.broker.port);
        println!("│ Devices: {}", self.publisher.devices.join(", "));
        println!(
            "│ Waveform: {}s cycle, {}s interval, max {}",
            self.publisher.cycle_seconds, self.publisher.interval_seconds, self.publisher.amplitude_max
        );
        println!("│ Format: {:?}", self.publisher.value_format);
        println!("│ Display: {} -> {}", self.display.topic, keys.join(", "));
        println!("│ Log Level: {}", self.logging.level);
        println!("└─────────────────────────────────────────┘");
    }
}
