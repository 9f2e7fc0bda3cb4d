//! NewFocus 8742 picomotor controller driver.
//!
//! The connect handshake reads the version banner (`VE?`), then scans motor
//! ports 1..=4 with `QM?` and adopts the first port reporting a Standard
//! motor. Commands are user-style `xxAAnn` text, translated to the wire form
//! by [`crate::protocol::newfocus`].

use anyhow::{bail, ensure, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::core::{DataPoint, Instrument, InstrumentState, Motor, Sign};
use crate::hardware::HardwareAdapter;
use crate::protocol::newfocus::{self, CommandParser, MotorType};

const MOTOR_PORTS: std::ops::RangeInclusive<u8> = 1..=4;
const DATA_CHANNEL_CAPACITY: usize = 256;

pub struct Picomotor {
    id: String,
    adapter: Box<dyn HardwareAdapter>,
    adapter_config: Value,
    parser: CommandParser,
    state: InstrumentState,
    channel: u8,
    max_velocity: u32,
    max_acceleration: u32,
    data_tx: broadcast::Sender<DataPoint>,
}

impl Picomotor {
    pub fn new(
        id: &str,
        adapter: Box<dyn HardwareAdapter>,
        max_velocity: u32,
        max_acceleration: u32,
    ) -> Self {
        let (data_tx, _) = broadcast::channel(DATA_CHANNEL_CAPACITY);
        Self {
            id: id.to_string(),
            adapter,
            adapter_config: Value::Null,
            parser: CommandParser::new(),
            state: InstrumentState::Uninitialized,
            channel: 1,
            max_velocity,
            max_acceleration,
            data_tx,
        }
    }

    /// Adapter config overrides applied at connect.
    pub fn with_adapter_config(mut self, config: Value) -> Self {
        self.adapter_config = config;
        self
    }

    /// Sender half of the sample channel, for runners to publish through.
    pub fn publisher(&self) -> broadcast::Sender<DataPoint> {
        self.data_tx.clone()
    }

    pub fn max_velocity(&self) -> u32 {
        self.max_velocity
    }

    pub fn max_acceleration(&self) -> u32 {
        self.max_acceleration
    }

    fn ensure_ready(&self) -> Result<()> {
        ensure!(
            matches!(self.state, InstrumentState::Idle | InstrumentState::Running),
            "picomotor '{}' is not connected (state {:?})",
            self.id,
            self.state
        );
        Ok(())
    }

    /// Send user-style command text, raw. Replies keep controller addressing.
    async fn transact(&mut self, text: &str) -> Result<Option<String>> {
        let command = self.parser.parse(text)?;
        let wire = command.encode();
        if command.expects_reply() {
            let raw = self
                .adapter
                .query(&wire)
                .await
                .with_context(|| format!("query '{text}' failed"))?;
            Ok(Some(newfocus::parse_reply(&raw)))
        } else {
            self.adapter
                .send(&wire)
                .await
                .with_context(|| format!("command '{text}' failed"))?;
            Ok(None)
        }
    }

    /// Query returning the addressed value with addressing stripped.
    async fn query_value(&mut self, text: &str) -> Result<String> {
        let reply = self
            .transact(text)
            .await?
            .with_context(|| format!("'{text}' returned no reply"))?;
        Ok(newfocus::strip_address(&reply).trim().to_string())
    }

    async fn scan_motor_ports(&mut self) -> Result<Option<u8>> {
        for port in MOTOR_PORTS {
            let reply = self.query_value(&format!("{port}QM?")).await?;
            match MotorType::from_reply(&reply) {
                Some(MotorType::Standard) => {
                    log::info!("MOTOR: standard motor found on port {port}");
                    return Ok(Some(port));
                }
                Some(kind) => {
                    log::debug!("MOTOR: port {port}: {}", kind.description());
                }
                None => {
                    log::warn!("MOTOR: port {port}: unreadable QM? reply '{reply}'");
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Instrument for Picomotor {
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
            "picomotor '{}' already initialized",
            self.id
        );
        self.state = InstrumentState::Connecting;

        let config = self.adapter_config.clone();
        if let Err(e) = self.adapter.connect(&config).await {
            self.state = InstrumentState::Error;
            return Err(e).context("picomotor adapter connect failed");
        }

        match self.query_value("VE?").await {
            Ok(banner) => {
                log::info!("MOTOR: connected to controller: {banner}");
            }
            Err(e) => {
                self.state = InstrumentState::Error;
                return Err(e).context("version handshake failed");
            }
        }

        match self.scan_motor_ports().await {
            Ok(Some(port)) => self.channel = port,
            Ok(None) => {
                log::warn!(
                    "MOTOR: no standard motor found on ports {:?}, keeping port {}",
                    MOTOR_PORTS,
                    self.channel
                );
            }
            Err(e) => {
                self.state = InstrumentState::Error;
                return Err(e).context("motor port scan failed");
            }
        }

        self.state = InstrumentState::Idle;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.state = InstrumentState::ShuttingDown;
        self.adapter
            .disconnect()
            .await
            .context("picomotor adapter disconnect failed")?;
        self.state = InstrumentState::Uninitialized;
        log::info!("MOTOR: disconnected");
        Ok(())
    }

    fn data_channel(&self) -> broadcast::Receiver<DataPoint> {
        self.data_tx.subscribe()
    }
}

#[async_trait]
impl Motor for Picomotor {
    fn channel(&self) -> u8 {
        self.channel
    }

    async fn command(&mut self, text: &str) -> Result<Option<String>> {
        self.ensure_ready()?;
        self.transact(text).await
    }

    async fn position(&mut self, channel: u8) -> Result<i64> {
        self.ensure_ready()?;
        let reply = self.query_value(&format!("{channel}TP?")).await?;
        reply
            .parse::<i64>()
            .with_context(|| format!("unparsable position reply '{reply}'"))
    }

    async fn set_home(&mut self, channel: u8, position: i64) -> Result<()> {
        self.ensure_ready()?;
        self.transact(&format!("{channel}DH{position}")).await?;
        Ok(())
    }

    async fn move_relative(&mut self, channel: u8, steps: i64) -> Result<()> {
        self.ensure_ready()?;
        self.transact(&format!("{channel}PR{steps:+}")).await?;
        Ok(())
    }

    async fn move_absolute(&mut self, channel: u8, target: i64) -> Result<()> {
        self.ensure_ready()?;
        self.transact(&format!("{channel}PA{target}")).await?;
        Ok(())
    }

    async fn jog(&mut self, channel: u8, direction: Sign) -> Result<()> {
        self.ensure_ready()?;
        self.transact(&format!("{channel}MV{}", direction.as_char()))
            .await?;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.ensure_ready()?;
        self.transact("ST").await?;
        log::info!("MOTOR: stop requested");
        Ok(())
    }

    async fn velocity(&mut self, channel: u8) -> Result<u32> {
        self.ensure_ready()?;
        let reply = self.query_value(&format!("{channel}VA?")).await?;
        reply
            .parse::<u32>()
            .with_context(|| format!("unparsable velocity reply '{reply}'"))
    }

    async fn set_velocity(&mut self, channel: u8, steps_per_sec: u32) -> Result<()> {
        self.ensure_ready()?;
        if steps_per_sec == 0 || steps_per_sec > self.max_velocity {
            bail!(
                "velocity {steps_per_sec} outside 1..={} steps/s",
                self.max_velocity
            );
        }
        self.transact(&format!("{channel}VA{steps_per_sec}")).await?;
        Ok(())
    }

    async fn acceleration(&mut self, channel: u8) -> Result<u32> {
        self.ensure_ready()?;
        let reply = self.query_value(&format!("{channel}AC?")).await?;
        reply
            .parse::<u32>()
            .with_context(|| format!("unparsable acceleration reply '{reply}'"))
    }

    async fn set_acceleration(&mut self, channel: u8, steps_per_sec2: u32) -> Result<()> {
        self.ensure_ready()?;
        if steps_per_sec2 == 0 || steps_per_sec2 > self.max_acceleration {
            bail!(
                "acceleration {steps_per_sec2} outside 1..={} steps/s²",
                self.max_acceleration
            );
        }
        self.transact(&format!("{channel}AC{steps_per_sec2}"))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockAdapter;

    fn connected_motor() -> (Picomotor, MockAdapter) {
        let mock = MockAdapter::new();
        mock.on("VE?", "8742 Version 2.2 08/01/13");
        mock.on("1>1 QM?", "1>0");
        mock.on("1>2 QM?", "1>3");
        mock.on("1>3 QM?", "1>0");
        mock.on("1>4 QM?", "1>0");
        (
            Picomotor::new("picomotor", Box::new(mock.clone()), 2000, 100_000),
            mock,
        )
    }

    #[tokio::test]
    async fn handshake_adopts_standard_motor_port() {
        let (mut motor, _mock) = connected_motor();
        motor.initialize().await.unwrap();
        assert_eq!(motor.state(), InstrumentState::Idle);
        assert_eq!(motor.channel(), 2);
    }

    #[tokio::test]
    async fn handshake_keeps_default_port_without_standard_motor() {
        let mock = MockAdapter::new();
        mock.on("VE?", "8742 Version 2.2 08/01/13");
        for port in 1..=4 {
            mock.on(&format!("1>{port} QM?"), "1>0");
        }
        let mut motor = Picomotor::new("picomotor", Box::new(mock), 2000, 100_000);
        motor.initialize().await.unwrap();
        assert_eq!(motor.channel(), 1);
    }

    #[tokio::test]
    async fn position_strips_addressing() {
        let (mut motor, mock) = connected_motor();
        motor.initialize().await.unwrap();
        mock.on("1>2 TP?", "1>1750");
        assert_eq!(motor.position(2).await.unwrap(), 1750);
    }

    #[tokio::test]
    async fn moves_encode_signed_steps() {
        let (mut motor, mock) = connected_motor();
        motor.initialize().await.unwrap();
        mock.clear_sent();

        motor.move_relative(2, 100).await.unwrap();
        motor.move_relative(2, -250).await.unwrap();
        motor.jog(2, Sign::Plus).await.unwrap();
        motor.stop().await.unwrap();

        assert_eq!(
            mock.sent(),
            vec!["1>2 PR +100", "1>2 PR -250", "1>2 MV +", "ST"]
        );
    }

    #[tokio::test]
    async fn velocity_limits_are_enforced() {
        let (mut motor, mock) = connected_motor();
        motor.initialize().await.unwrap();

        assert!(motor.set_velocity(2, 0).await.is_err());
        assert!(motor.set_velocity(2, 2001).await.is_err());
        motor.set_velocity(2, 1750).await.unwrap();
        assert!(mock.sent().contains(&"1>2 VA 1750".to_string()));
    }

    #[tokio::test]
    async fn commands_require_connection() {
        let (mut motor, _mock) = connected_motor();
        assert!(motor.position(1).await.is_err());
    }
}
