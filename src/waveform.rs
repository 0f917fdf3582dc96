//! ```text
//! ==============================================================================
//! waveform.rs - deterministic triangular drift generator
//! ==============================================================================
//!
//! purpose:
//!     simulates slow sensor drift. one cycle of a triangle wave is sampled
//!     once per publish interval; every sensor reports its base offset plus
//!     the current amplitude.
//!
//!     cycle 20s, interval 2s, max 0.4:
//!
//!         step   0    1    2    3    4    5    6    7    8    9
//!         amp    0  .08  .16  .24  .32   .4  .32  .24  .16  .08
//!
//! ==============================================================================
//! ```

use crate::domain::{Envelope, MeasurementValue, SensorKey, ValueFormat};
use crate::error::{Result, TelemetryError};

/// upper bound on samples per cycle
pub const MAX_STEPS: usize = 1 << 20;

/// one full period of amplitudes, always an even number of entries
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformTable {
    amplitudes: Vec<f64>,
}

impl WaveformTable {
    pub fn len(&self) -> usize {
        self.amplitudes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.amplitudes.is_empty()
    }

    /// amplitude at `step`, wrapping modulo the table length
    pub fn at(&self, step: usize) -> f64 {
        self.amplitudes[step % self.amplitudes.len()]
    }

    /// the step that follows `step`
    pub fn next_step(&self, step: usize) -> usize {
        (step + 1) % self.amplitudes.len()
    }

    pub fn amplitudes(&self) -> &[f64] {
        &self.amplitudes
    }
}

/// build the amplitude table for one cycle
pub fn build_table(cycle_seconds: f64, interval_seconds: f64, max_amplitude: f64) -> Result<WaveformTable> {
    if !interval_seconds.is_finite() || interval_seconds <= 0.0 {
        return Err(TelemetryError::Configuration(format!(
            "interval must be a positive number of seconds (got {})",
            interval_seconds
        )));
    }
    if !cycle_seconds.is_finite() || cycle_seconds <= 0.0 {
        return Err(TelemetryError::Configuration(format!(
            "cycle must be a positive number of seconds (got {})",
            cycle_seconds
        )));
    }
    if !max_amplitude.is_finite() || max_amplitude < 0.0 {
        return Err(TelemetryError::Configuration(format!(
            "amplitude maximum must be a finite, non-negative number (got {})",
            max_amplitude
        )));
    }

    let ratio = (cycle_seconds / interval_seconds).round_ties_even();
    if ratio > MAX_STEPS as f64 {
        return Err(TelemetryError::Configuration(format!(
            "cycle {}s is too long for an interval of {}s (more than {} steps)",
            cycle_seconds, interval_seconds, MAX_STEPS
        )));
    }

    let mut steps = (ratio as usize).max(2);
    // symmetric triangle needs an even count
    if steps % 2 != 0 {
        steps += 1;
    }
    let half = steps / 2;

    let rising = (0..=half).map(|i| i as f64 / half as f64);
    let falling = (1..half).rev().map(|i| i as f64 / half as f64);
    let amplitudes = rising.chain(falling).map(|f| f * max_amplitude).collect();

    Ok(WaveformTable { amplitudes })
}

/// which sensors a device reports and where each one idles
#[derive(Debug, Clone, PartialEq)]
pub struct SensorLayout {
    pub device: String,
    pub buses: u32,
    pub sensors_per_bus: u32,
    /// per-sensor base value; sensors beyond the list idle at their index
    pub base_offsets: Vec<f64>,
}

impl SensorLayout {
    pub fn new(device: impl Into<String>, buses: u32, sensors_per_bus: u32) -> Self {
        Self {
            device: device.into(),
            buses,
            sensors_per_bus,
            base_offsets: Vec::new(),
        }
    }

    pub fn with_base_offsets(mut self, offsets: Vec<f64>) -> Self {
        self.base_offsets = offsets;
        self
    }

    pub fn base_offset(&self, sensor: u32) -> f64 {
        self.base_offsets
            .get(sensor as usize)
            .copied()
            .unwrap_or(sensor as f64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.device.is_empty() || self.device.contains(['+', '#']) {
            return Err(TelemetryError::Configuration(format!(
                "invalid device name '{}'",
                self.device
            )));
        }
        if self.buses == 0 || self.sensors_per_bus == 0 {
            return Err(TelemetryError::Configuration(
                "a device needs at least one bus with one sensor".into(),
            ));
        }
        if let Some(bad) = self.base_offsets.iter().find(|o| !o.is_finite()) {
            return Err(TelemetryError::Configuration(format!(
                "base offset {} is not a finite number",
                bad
            )));
        }
        Ok(())
    }

    /// keys in publish order: bus-major, then sensor
    pub fn keys(&self) -> impl Iterator<Item = (u32, SensorKey)> + '_ {
        (0..self.buses).flat_map(move |bus| {
            (0..self.sensors_per_bus).map(move |sensor| (sensor, SensorKey::new(&self.device, bus, sensor)))
        })
    }
}

/// measurements for one step, without timestamp
pub fn payload_for_step(table: &WaveformTable, step: usize, layout: &SensorLayout, format: ValueFormat) -> Envelope {
    let amplitude = table.at(step);
    let mut envelope = Envelope::default();
    for (sensor, key) in layout.keys() {
        let value = layout.base_offset(sensor) + amplitude;
        envelope.push(key, MeasurementValue::encode(value, format));
    }
    envelope
}

/// table plus layout plus format: everything a publisher needs per tick
#[derive(Debug, Clone)]
pub struct WaveformGenerator {
    table: WaveformTable,
    layout: SensorLayout,
    format: ValueFormat,
}

impl WaveformGenerator {
    pub fn new(
        cycle_seconds: f64,
        interval_seconds: f64,
        max_amplitude: f64,
        layout: SensorLayout,
        format: ValueFormat,
    ) -> Result<Self> {
        layout.validate()?;
        let table = build_table(cycle_seconds, interval_seconds, max_amplitude)?;
        Ok(Self { table, layout, format })
    }

    pub fn table(&self) -> &WaveformTable {
        &self.table
    }

    pub fn layout(&self) -> &SensorLayout {
        &self.layout
    }

    pub fn payload(&self, step: usize) -> Envelope {
        payload_for_step(&self.table, step, &self.layout, self.format)
    }
}
