//! ==============================================================================
//! main.rs - telemetry simulator entry point
//! ==============================================================================
//!
//! purpose:
//!     runs the whole telemetry pipeline in one process: one simulated
//!     publisher per configured device plus the led-matrix subscriber,
//!     all connected through the in-process loopback broker.
//!
//! architecture:
//!
//!     ┌────────────┐  sbc0/measurements  ┌────────────────┐
//!     │ sbc0-sim   │ ──────────────────> │                │     ┌────────────┐
//!     └────────────┘                     │ LoopbackBroker │ ──> │ ledm       │
//!     ┌────────────┐  sbc1/measurements  │                │     │ subscriber │
//!     │ sbc1-sim   │ ──────────────────> │                │     └─────┬──────┘
//!     └────────────┘                     └────────────────┘           │
//!                                                              TextPanel<ConsoleSurface>
//!
//! usage:
//!     telemetry-sim --config config/telemetry.toml --format zero-padded
//!     RUST_LOG=telemetry_sim=debug telemetry-sim
//!
//! ==============================================================================

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use telemetry_sim::{
    Config, ConsoleSurface, LoopbackBroker, Publisher, SensorKey, Subscriber, TextPanel, ValueFormat,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// command line overrides on top of the config file
#[derive(Parser, Debug)]
#[command(name = "telemetry-sim", version, about = "Simulated sensor telemetry publisher and display")]
struct Args {
    /// config file (default: probe config/telemetry.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// seconds between publishes
    #[arg(long)]
    interval: Option<f64>,

    /// seconds per waveform cycle
    #[arg(long)]
    cycle: Option<f64>,

    /// waveform peak added to each base offset
    #[arg(long)]
    amplitude: Option<f64>,

    /// numeric | zero-padded
    #[arg(long)]
    format: Option<ValueFormat>,

    /// topic the display subscribes to
    #[arg(long)]
    topic: Option<String>,

    /// first key shown on the display
    #[arg(long)]
    key1: Option<SensorKey>,

    /// second key shown on the display
    #[arg(long)]
    key2: Option<SensorKey>,

    /// publish envelopes without a timestamp field
    #[arg(long)]
    no_timestamp: bool,

    /// log filter when RUST_LOG is unset (e.g. info, debug)
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(v) = self.interval {
            config.publisher.interval_seconds = v;
        }
        if let Some(v) = self.cycle {
            config.publisher.cycle_seconds = v;
        }
        if let Some(v) = self.amplitude {
            config.publisher.amplitude_max = v;
        }
        if let Some(v) = self.format {
            config.publisher.value_format = v;
        }
        if self.no_timestamp {
            config.publisher.include_timestamp = false;
        }
        if let Some(v) = self.topic {
            config.display.topic = v;
        }
        if let Some(key) = self.key1 {
            match config.display.keys.first_mut() {
                Some(slot) => *slot = key,
                None => config.display.keys.push(key),
            }
        }
        if let Some(key) = self.key2 {
            match config.display.keys.get_mut(1) {
                Some(slot) => *slot = key,
                None => config.display.keys.push(key),
            }
        }
        if let Some(v) = self.log_level {
            config.logging.level = v;
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Args::parse();

    // startup banner
    println!("===========================================================");
    println!("  Telemetry Simulator");
    println!("  waveform publishers -> loopback bus -> led display");
    println!("===========================================================");

    // step 1: configuration (file, then command line)
    let mut config = match args.config.take() {
        Some(path) => Config::load(&path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::load_or_default(),
    };
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;

    init_logging(&config.logging.level);
    config.print_summary();

    // step 2: build components; any configuration error stops us here
    let broker = LoopbackBroker::new();
    let endpoint = config.endpoint();

    let mut publishers = Vec::new();
    for device in &config.publisher.devices {
        let transport = Arc::new(broker.client(format!("{}-sim", device)));
        let publisher = Publisher::new(config.publisher_options(device), endpoint.clone(), transport)
            .with_context(|| format!("publisher for {}", device))?;
        publishers.push(publisher);
    }

    let options = config.subscriber_options();
    let transport = Arc::new(broker.client(options.name.clone()));
    let panel = TextPanel::new(ConsoleSurface::new(), config.panel_layout());
    let subscriber = Arc::new(Subscriber::new(options, endpoint, transport, Box::new(panel))?);

    // step 3: run
    let display = tokio::spawn({
        let subscriber = subscriber.clone();
        async move { subscriber.run().await }
    });
    for publisher in &publishers {
        let state = publisher.start().await;
        info!("{} publisher {}", publisher.device(), state);
    }

    println!("[MAIN] Running - press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("could not listen for Ctrl-C: {}", e);
    }

    // step 4: teardown never fails
    println!("[MAIN] Shutting down...");
    for publisher in &publishers {
        publisher.stop().await;
    }
    subscriber.stop();
    if let Err(e) = display.await {
        warn!("display task ended abnormally: {}", e);
    }
    println!("[MAIN] Bye");
    Ok(())
}
