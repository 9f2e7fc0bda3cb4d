//! Agilent E3631A triple-output power supply driver (SCPI).
//!
//! The bench drives one rail at a time. Voltages are programmed as
//! magnitudes with the supply's one-decimal display resolution; the rail
//! sign lives in the rail selection (`INST P25V` / `INST N25V`).

use anyhow::{anyhow, bail, ensure, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::core::{DataPoint, Instrument, InstrumentState, PowerSupply};
use crate::hardware::HardwareAdapter;

const DATA_CHANNEL_CAPACITY: usize = 256;

/// Output rails of the E3631A.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rail {
    P6V,
    P25V,
    N25V,
}

impl Rail {
    /// Parse a human rail label ("+25 V", "-25V", "+6 V").
    pub fn parse(label: &str) -> Result<Self> {
        let compact: String = label
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| match c {
                '+' => 'P',
                '-' => 'N',
                other => other.to_ascii_uppercase(),
            })
            .collect();
        match compact.as_str() {
            "P6V" => Ok(Rail::P6V),
            "P25V" => Ok(Rail::P25V),
            "N25V" => Ok(Rail::N25V),
            _ => Err(anyhow!("unknown rail '{label}'")),
        }
    }

    pub fn scpi(self) -> &'static str {
        match self {
            Rail::P6V => "P6V",
            Rail::P25V => "P25V",
            Rail::N25V => "N25V",
        }
    }

    /// Programmable magnitude limit in volts.
    pub fn limit(self) -> f64 {
        match self {
            Rail::P6V => 6.0,
            Rail::P25V | Rail::N25V => 25.0,
        }
    }
}

pub struct AgilentE3631A {
    id: String,
    adapter: Box<dyn HardwareAdapter>,
    adapter_config: Value,
    state: InstrumentState,
    rail: Rail,
    current_limit_amps: f64,
    programmed: f64,
    data_tx: broadcast::Sender<DataPoint>,
}

impl AgilentE3631A {
    pub fn new(
        id: &str,
        adapter: Box<dyn HardwareAdapter>,
        rail: Rail,
        current_limit_amps: f64,
    ) -> Self {
        let (data_tx, _) = broadcast::channel(DATA_CHANNEL_CAPACITY);
        Self {
            id: id.to_string(),
            adapter,
            adapter_config: Value::Null,
            state: InstrumentState::Uninitialized,
            rail,
            current_limit_amps,
            programmed: 0.0,
            data_tx,
        }
    }

    pub fn with_adapter_config(mut self, config: Value) -> Self {
        self.adapter_config = config;
        self
    }

    pub fn publisher(&self) -> broadcast::Sender<DataPoint> {
        self.data_tx.clone()
    }

    pub fn rail(&self) -> Rail {
        self.rail
    }

    fn ensure_ready(&self) -> Result<()> {
        ensure!(
            matches!(self.state, InstrumentState::Idle | InstrumentState::Running),
            "supply '{}' is not connected (state {:?})",
            self.id,
            self.state
        );
        Ok(())
    }

    /// Program `programmed + delta`, bounds checked.
    pub async fn jog(&mut self, delta: f64) -> Result<()> {
        let target = self.programmed + delta;
        self.set_voltage(target).await
    }
}

#[async_trait]
impl Instrument for AgilentE3631A {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> InstrumentState {
        self.state
    }

    async fn initialize(&mut self) -> Result<()> {
        ensure!(
            matches!(
                self.state,
                InstrumentState::Uninitialized | InstrumentState::Error
            ),
            "supply '{}' already initialized",
            self.id
        );
        self.state = InstrumentState::Connecting;

        let config = self.adapter_config.clone();
        if let Err(e) = self.adapter.connect(&config).await {
            self.state = InstrumentState::Error;
            return Err(e).context("supply adapter connect failed");
        }

        let identity = match self.adapter.query("*IDN?").await {
            Ok(idn) => idn.trim().to_string(),
            Err(e) => {
                self.state = InstrumentState::Error;
                return Err(e).context("*IDN? handshake failed");
            }
        };
        log::info!("AGILENT: connected to '{identity}'");

        self.adapter
            .send(&format!("INST {}", self.rail.scpi()))
            .await
            .context("rail selection failed")?;
        self.adapter
            .send(&format!("CURR {:.3}", self.current_limit_amps))
            .await
            .context("current limit programming failed")?;
        log::info!(
            "AGILENT: rail {} selected, current limit {:.3} A",
            self.rail.scpi(),
            self.current_limit_amps
        );

        self.state = InstrumentState::Idle;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        if matches!(self.state, InstrumentState::Idle | InstrumentState::Running) {
            // Leave the bench de-energized.
            if let Err(e) = self.adapter.send("OUTP OFF").await {
                log::warn!("AGILENT: could not disable output at shutdown: {e}");
            }
        }
        self.state = InstrumentState::ShuttingDown;
        self.adapter
            .disconnect()
            .await
            .context("supply adapter disconnect failed")?;
        self.state = InstrumentState::Uninitialized;
        log::info!("AGILENT: disconnected");
        Ok(())
    }

    fn data_channel(&self) -> broadcast::Receiver<DataPoint> {
        self.data_tx.subscribe()
    }
}

#[async_trait]
impl PowerSupply for AgilentE3631A {
    async fn set_voltage(&mut self, volts: f64) -> Result<()> {
        self.ensure_ready()?;
        if !volts.is_finite() || volts <= 0.0 || volts > self.rail.limit() {
            bail!(
                "voltage {volts:.1} V outside (0, {:.1}] for rail {}",
                self.rail.limit(),
                self.rail.scpi()
            );
        }
        self.adapter
            .send(&format!("VOLT {volts:.1}"))
            .await
            .with_context(|| format!("programming {volts:.1} V failed"))?;
        self.programmed = volts;
        Ok(())
    }

    fn programmed_voltage(&self) -> f64 {
        self.programmed
    }

    async fn measure_voltage(&mut self) -> Result<f64> {
        self.ensure_ready()?;
        let reply = self
            .adapter
            .query("MEAS:VOLT?")
            .await
            .context("MEAS:VOLT? failed")?;
        reply
            .trim()
            .parse::<f64>()
            .with_context(|| format!("unparsable voltage reading '{reply}'"))
    }

    async fn output_on(&mut self) -> Result<()> {
        self.ensure_ready()?;
        self.adapter.send("OUTP ON").await.context("OUTP ON failed")?;
        self.state = InstrumentState::Running;
        log::info!("AGILENT: output on");
        Ok(())
    }

    async fn output_off(&mut self) -> Result<()> {
        self.ensure_ready()?;
        self.adapter
            .send("OUTP OFF")
            .await
            .context("OUTP OFF failed")?;
        self.state = InstrumentState::Idle;
        log::info!("AGILENT: output off");
        Ok(())
    }
}
