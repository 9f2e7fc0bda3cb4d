//! Core vocabulary: sample type, instrument lifecycle, and the capability
//! traits the runners program against.
//!
//! Every instrument publishes [`DataPoint`]s on a broadcast channel so the CLI
//! (or any future surface) can observe a run without being wired into it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use anyhow::Result;

/// One logged sample from an instrument.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataPoint {
    pub timestamp: DateTime<Utc>,
    /// Instrument id the sample came from (e.g. "picomotor").
    pub instrument: String,
    /// What was sampled: "position", "voltage", "displacement", ...
    pub channel: String,
    pub value: f64,
    pub unit: String,
}

impl DataPoint {
    pub fn now(instrument: &str, channel: &str, value: f64, unit: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            instrument: instrument.to_string(),
            channel: channel.to_string(),
            value,
            unit: unit.to_string(),
        }
    }
}

/// Instrument lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentState {
    Uninitialized,
    Connecting,
    Idle,
    /// A measurement or cycle is in progress.
    Running,
    /// Release of the transport is in progress.
    ShuttingDown,
    Error,
}

/// Common lifecycle surface for all bench instruments.
#[async_trait]
pub trait Instrument: Send + Sync {
    /// Stable identifier used in logs and sample records.
    fn id(&self) -> &str;

    fn state(&self) -> InstrumentState;

    /// Connect and handshake. Idempotent from `Uninitialized` or `Error`.
    async fn initialize(&mut self) -> Result<()>;

    /// Release the transport. Safe to call in any state.
    async fn shutdown(&mut self) -> Result<()>;

    /// Subscribe to samples published by this instrument.
    fn data_channel(&self) -> broadcast::Receiver<DataPoint>;
}

/// Direction of a single move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sign {
    Plus,
    Minus,
}

impl Sign {
    pub fn as_char(self) -> char {
        match self {
            Sign::Plus => '+',
            Sign::Minus => '-',
        }
    }

    pub fn factor(self) -> i64 {
        match self {
            Sign::Plus => 1,
            Sign::Minus => -1,
        }
    }
}

/// Stepper-style motion controller.
#[async_trait]
pub trait Motor: Instrument {
    /// Channel adopted during the connect handshake.
    fn channel(&self) -> u8;

    /// Send raw command text, returning the reply when the command queries.
    async fn command(&mut self, text: &str) -> Result<Option<String>>;

    async fn position(&mut self, channel: u8) -> Result<i64>;

    /// Mark the current position as the given home value.
    async fn set_home(&mut self, channel: u8, position: i64) -> Result<()>;

    async fn move_relative(&mut self, channel: u8, steps: i64) -> Result<()>;

    async fn move_absolute(&mut self, channel: u8, target: i64) -> Result<()>;

    /// Start an indefinite move; runs until `stop`.
    async fn jog(&mut self, channel: u8, direction: Sign) -> Result<()>;

    async fn stop(&mut self) -> Result<()>;

    async fn velocity(&mut self, channel: u8) -> Result<u32>;

    async fn set_velocity(&mut self, channel: u8, steps_per_sec: u32) -> Result<()>;

    async fn acceleration(&mut self, channel: u8) -> Result<u32>;

    async fn set_acceleration(&mut self, channel: u8, steps_per_sec2: u32) -> Result<()>;
}

/// Programmable DC power supply.
#[async_trait]
pub trait PowerSupply: Instrument {
    /// Program the selected rail. Value is clamped to the rail limits by the
    /// driver and rejected when out of bounds.
    async fn set_voltage(&mut self, volts: f64) -> Result<()>;

    /// Last programmed voltage.
    fn programmed_voltage(&self) -> f64;

    /// Measured output voltage.
    async fn measure_voltage(&mut self) -> Result<f64>;

    async fn output_on(&mut self) -> Result<()>;

    async fn output_off(&mut self) -> Result<()>;
}

/// Displacement interferometer with optional raw stream recording.
#[async_trait]
pub trait Interferometer: Instrument {
    /// Device measurement mode string ("system idle", "measurement running", ...).
    async fn mode(&mut self) -> Result<String>;

    async fn start_measurement(&mut self) -> Result<()>;

    async fn stop_measurement(&mut self) -> Result<()>;

    /// Absolute position of the given axis, in picometres.
    async fn absolute_position(&mut self, axis: u8) -> Result<i64>;

    /// Begin capturing the displacement stream to a file; returns the path.
    async fn start_recording(&mut self) -> Result<std::path::PathBuf>;

    async fn stop_recording(&mut self) -> Result<()>;
}

/// Sink for logged samples. CSV in production, in-memory in tests.
#[async_trait]
pub trait StorageWriter: Send {
    async fn write(&mut self, data: &[DataPoint]) -> Result<()>;

    /// Flush and close. The writer must not be used afterwards.
    async fn shutdown(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_wire_forms() {
        assert_eq!(Sign::Plus.as_char(), '+');
        assert_eq!(Sign::Minus.as_char(), '-');
        assert_eq!(Sign::Plus.factor(), 1);
        assert_eq!(Sign::Minus.factor(), -1);
    }

    #[test]
    fn datapoint_now_fills_fields() {
        let dp = DataPoint::now("picomotor", "position", 42.0, "steps");
        assert_eq!(dp.instrument, "picomotor");
        assert_eq!(dp.channel, "position");
        assert_eq!(dp.value, 42.0);
        assert_eq!(dp.unit, "steps");
    }
}
