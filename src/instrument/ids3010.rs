//! Attocube IDS3010 interferometer driver.
//!
//! Control plane is JSON-RPC 2.0 over a line-framed TCP adapter; every method
//! lives under the `com.attocube.ids` namespace and most replies are arrays
//! whose first element is a device error number. The displacement data plane
//! is a separate TCP stream of fixed-size binary frames, optionally recorded
//! raw to a `.aws` file.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, ensure, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use crate::core::{DataPoint, Instrument, InstrumentState, Interferometer};
use crate::data::storage::{timestamp_token, AwsRecorder};
use crate::hardware::HardwareAdapter;

const RPC_NAMESPACE: &str = "com.attocube.ids";
const DATA_CHANNEL_CAPACITY: usize = 1024;
const MODE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const MODE_TIMEOUT: Duration = Duration::from_secs(30);

pub const MODE_IDLE: &str = "system idle";
pub const MODE_MEASUREMENT_STARTING: &str = "measurement starting";
pub const MODE_MEASUREMENT_RUNNING: &str = "measurement running";
pub const MODE_ALIGNMENT_STARTING: &str = "optics alignment starting";
pub const MODE_ALIGNMENT_RUNNING: &str = "optics alignment running";

/// Contrast figures from an optics alignment pass, in permille.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignmentReport {
    pub contrast_permille: i64,
    pub baseband_permille: i64,
}

/// Stream and recording parameters, from settings.
#[derive(Debug, Clone)]
pub struct IdsOptions {
    pub stream_host: String,
    pub stream_port: u16,
    /// Displacement sample interval in microseconds.
    pub interval_us: u32,
    pub record_dir: PathBuf,
    pub record_prefix: String,
}

struct Recording {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<Result<()>>,
    path: PathBuf,
}

pub struct Ids3010 {
    id: String,
    adapter: Box<dyn HardwareAdapter>,
    adapter_config: Value,
    options: IdsOptions,
    state: InstrumentState,
    next_request_id: u64,
    master_axis: u8,
    recording: Option<Recording>,
    data_tx: broadcast::Sender<DataPoint>,
}

impl Ids3010 {
    pub fn new(id: &str, adapter: Box<dyn HardwareAdapter>, options: IdsOptions) -> Self {
        let (data_tx, _) = broadcast::channel(DATA_CHANNEL_CAPACITY);
        Self {
            id: id.to_string(),
            adapter,
            adapter_config: Value::Null,
            options,
            state: InstrumentState::Uninitialized,
            next_request_id: 1,
            master_axis: 0,
            recording: None,
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

    pub fn master_axis(&self) -> u8 {
        self.master_axis
    }

    /// One JSON-RPC round trip; returns the raw `result` value.
    async fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_request_id;
        self.next_request_id += 1;
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": format!("{RPC_NAMESPACE}.{method}"),
            "params": params,
        });
        let reply = self
            .adapter
            .query(&request.to_string())
            .await
            .with_context(|| format!("rpc '{method}' failed"))?;
        let response: Value = serde_json::from_str(&reply)
            .with_context(|| format!("rpc '{method}': unparsable reply '{reply}'"))?;
        if let Some(error) = response.get("error") {
            bail!("rpc '{method}' rejected: {error}");
        }
        if let Some(reply_id) = response.get("id").and_then(Value::as_u64) {
            if reply_id != id {
                log::warn!("INTERFERO: rpc id mismatch (sent {id}, got {reply_id})");
            }
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn call_array(&mut self, method: &str, params: Value) -> Result<Vec<Value>> {
        match self.call(method, params).await? {
            Value::Array(values) => Ok(values),
            other => bail!("rpc '{method}': expected array result, got {other}"),
        }
    }

    /// Round trip for methods whose result starts with a device error number.
    async fn call_checked(&mut self, method: &str, params: Value) -> Result<Vec<Value>> {
        let values = self.call_array(method, params).await?;
        if let Some(errno) = values.first().and_then(Value::as_i64) {
            if errno != 0 {
                let text = self
                    .error_text(errno)
                    .await
                    .unwrap_or_else(|_| format!("error {errno}"));
                bail!("rpc '{method}' failed: {text}");
            }
        }
        Ok(values)
    }

    async fn error_text(&mut self, errno: i64) -> Result<String> {
        let values = self
            .call_array("system_service.errorNumberToString", json!([1, errno]))
            .await?;
        values
            .first()
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("empty error translation"))
    }

    pub async fn device_name(&mut self) -> Result<String> {
        let values = self
            .call_array("system_service.getDeviceName", json!([]))
            .await?;
        values
            .first()
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("device reported no name"))
    }

    pub async fn pilot_laser_enabled(&mut self) -> Result<bool> {
        let values = self.call_array("pilotlaser.getEnabled", json!([])).await?;
        values
            .first()
            .and_then(Value::as_bool)
            .ok_or_else(|| anyhow!("unexpected pilotlaser.getEnabled reply"))
    }

    pub async fn enable_pilot_laser(&mut self) -> Result<()> {
        self.call_checked("pilotlaser.enable", json!([])).await?;
        log::info!("INTERFERO: pilot laser on");
        Ok(())
    }

    pub async fn disable_pilot_laser(&mut self) -> Result<()> {
        self.call_checked("pilotlaser.disable", json!([])).await?;
        log::info!("INTERFERO: pilot laser off");
        Ok(())
    }

    pub async fn init_mode(&mut self) -> Result<i64> {
        let values = self.call_checked("system.getInitMode", json!([])).await?;
        values
            .get(1)
            .and_then(Value::as_i64)
            .ok_or_else(|| anyhow!("unexpected getInitMode reply"))
    }

    pub async fn set_init_mode(&mut self, mode: i64) -> Result<()> {
        self.call_checked("system.setInitMode", json!([mode])).await?;
        Ok(())
    }

    pub async fn set_pass_mode(&mut self, enable: bool) -> Result<()> {
        self.call_checked("axis.setPassMode", json!([enable])).await?;
        Ok(())
    }

    /// Contrast of the given axis in permille: `(contrast, baseband)`.
    pub async fn contrast(&mut self, axis: u8) -> Result<(i64, i64)> {
        let values = self
            .call_checked("adjustment.getContrastInPermille", json!([axis]))
            .await?;
        let contrast = values
            .get(1)
            .and_then(Value::as_i64)
            .ok_or_else(|| anyhow!("unexpected contrast reply"))?;
        let baseband = values.get(2).and_then(Value::as_i64).unwrap_or(0);
        Ok((contrast, baseband))
    }

    async fn wait_for_mode(&mut self, target: &str) -> Result<()> {
        let deadline = Instant::now() + MODE_TIMEOUT;
        loop {
            let mode = Interferometer::mode(self).await?;
            if mode == target {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!("timed out waiting for '{target}', device still in '{mode}'");
            }
            tokio::time::sleep(MODE_POLL_INTERVAL).await;
        }
    }

    /// Run an optics alignment pass and report the master axis contrast.
    ///
    /// The device only accepts alignment from "system idle"; a running
    /// measurement must be stopped first.
    pub async fn align(&mut self) -> Result<AlignmentReport> {
        let mode = Interferometer::mode(self).await?;
        ensure!(
            mode == MODE_IDLE,
            "optics alignment requires '{MODE_IDLE}', device is in '{mode}'"
        );

        self.call_checked("system.startOpticsAlignment", json!([]))
            .await?;
        self.wait_for_mode(MODE_ALIGNMENT_RUNNING).await?;
        log::info!("INTERFERO: optics alignment running");

        // The device keeps the last alignment figures after the pass ends.
        self.stop_alignment().await?;
        let (contrast_permille, baseband_permille) = self.contrast(self.master_axis).await?;
        log::info!(
            "INTERFERO: alignment done, contrast {} permille, baseband {} permille",
            contrast_permille,
            baseband_permille
        );
        Ok(AlignmentReport {
            contrast_permille,
            baseband_permille,
        })
    }

    /// Stop an optics alignment, including one started by another client.
    pub async fn stop_alignment(&mut self) -> Result<()> {
        let mode = Interferometer::mode(self).await?;
        ensure!(
            mode == MODE_ALIGNMENT_STARTING || mode == MODE_ALIGNMENT_RUNNING,
            "no optics alignment to stop, device is in '{mode}'"
        );
        self.call_checked("system.stopOpticsAlignment", json!([]))
            .await?;
        self.wait_for_mode(MODE_IDLE).await?;
        log::info!("INTERFERO: optics alignment stopped");
        Ok(())
    }
}

#[async_trait]
impl Instrument for Ids3010 {
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
            "interferometer '{}' already initialized",
            self.id
        );
        self.state = InstrumentState::Connecting;

        let config = self.adapter_config.clone();
        if let Err(e) = self.adapter.connect(&config).await {
            self.state = InstrumentState::Error;
            return Err(e).context("interferometer adapter connect failed");
        }

        let name = match self.device_name().await {
            Ok(name) => name,
            Err(e) => {
                self.state = InstrumentState::Error;
                return Err(e).context("device name handshake failed");
            }
        };
        let axis = self
            .call_array("axis.getMasterAxis", json!([]))
            .await?
            .first()
            .and_then(Value::as_i64)
            .unwrap_or(0);
        self.master_axis = u8::try_from(axis).unwrap_or(0);

        let mode = Interferometer::mode(self).await?;
        log::info!(
            "INTERFERO: connected to '{name}', master axis {}, mode '{mode}'",
            self.master_axis
        );
        // A measurement left over from an earlier run blocks alignment and
        // mode changes; stop it so the device always connects into idle.
        if mode == MODE_MEASUREMENT_RUNNING {
            log::info!("INTERFERO: stopping stale measurement");
            self.call_checked("system.stopMeasurement", json!([]))
                .await?;
            self.wait_for_mode(MODE_IDLE).await?;
        }
        self.state = InstrumentState::Idle;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        if self.recording.is_some() {
            Interferometer::stop_recording(self).await?;
        }
        self.state = InstrumentState::ShuttingDown;
        self.adapter
            .disconnect()
            .await
            .context("interferometer adapter disconnect failed")?;
        self.state = InstrumentState::Uninitialized;
        log::info!("INTERFERO: disconnected");
        Ok(())
    }

    fn data_channel(&self) -> broadcast::Receiver<DataPoint> {
        self.data_tx.subscribe()
    }
}

#[async_trait]
impl Interferometer for Ids3010 {
    async fn mode(&mut self) -> Result<String> {
        let values = self.call_array("system.getCurrentMode", json!([])).await?;
        values
            .first()
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("unexpected getCurrentMode reply"))
    }

    async fn start_measurement(&mut self) -> Result<()> {
        let mode = Interferometer::mode(self).await?;
        match mode.as_str() {
            MODE_MEASUREMENT_RUNNING => {
                self.state = InstrumentState::Running;
                return Ok(());
            }
            MODE_ALIGNMENT_RUNNING | MODE_ALIGNMENT_STARTING => {
                bail!("cannot start measurement during optics alignment");
            }
            _ => {}
        }
        self.call_checked("system.startMeasurement", json!([]))
            .await?;
        self.wait_for_mode(MODE_MEASUREMENT_RUNNING).await?;
        self.state = InstrumentState::Running;
        log::info!("INTERFERO: measurement running");
        Ok(())
    }

    async fn stop_measurement(&mut self) -> Result<()> {
        if self.recording.is_some() {
            Interferometer::stop_recording(self).await?;
        }
        self.call_checked("system.stopMeasurement", json!([]))
            .await?;
        self.wait_for_mode(MODE_IDLE).await?;
        self.state = InstrumentState::Idle;
        log::info!("INTERFERO: measurement stopped");
        Ok(())
    }

    async fn absolute_position(&mut self, axis: u8) -> Result<i64> {
        let values = self
            .call_checked("displacement.getAbsolutePosition", json!([axis]))
            .await?;
        values
            .get(1)
            .and_then(Value::as_i64)
            .ok_or_else(|| anyhow!("unexpected getAbsolutePosition reply"))
    }

    async fn start_recording(&mut self) -> Result<PathBuf> {
        ensure!(self.recording.is_none(), "recording already in progress");
        ensure!(
            self.state == InstrumentState::Running,
            "start a measurement before recording"
        );

        let path = self.options.record_dir.join(format!(
            "{}_{}.aws",
            self.options.record_prefix,
            timestamp_token()
        ));
        let recorder = AwsRecorder::create(&path)?;
        let mut stream = DisplacementStream::open(
            &self.options.stream_host,
            self.options.stream_port,
            self.options.interval_us,
            self.master_axis,
        )
        .await?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let publisher = self.data_tx.clone();
        let instrument_id = self.id.clone();

        let handle = tokio::spawn(async move {
            let mut recorder = recorder;
            while !stop_flag.load(Ordering::Relaxed) {
                let raw = match timeout(Duration::from_secs(1), stream.read_raw()).await {
                    Err(_) => continue,
                    Ok(raw) => raw.context("displacement stream read failed")?,
                };
                recorder.write_frame(&raw)?;
                if let Ok(frame) = parse_frame(&raw) {
                    if let Some(&sample) = frame.samples.first() {
                        let _ = publisher.send(DataPoint::now(
                            &instrument_id,
                            "displacement",
                            f64::from(sample),
                            "pm",
                        ));
                    }
                }
            }
            recorder.finish()
        });

        log::info!("INTERFERO: recording to {}", path.display());
        self.recording = Some(Recording {
            stop,
            handle,
            path: path.clone(),
        });
        Ok(path)
    }

    async fn stop_recording(&mut self) -> Result<()> {
        let Some(recording) = self.recording.take() else {
            return Ok(());
        };
        recording.stop.store(true, Ordering::Relaxed);
        recording
            .handle
            .await
            .context("recording task panicked")??;
        log::info!("INTERFERO: recording closed ({})", recording.path.display());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Displacement stream
// ---------------------------------------------------------------------------

/// One decoded stream frame: two header words, a frame counter, then the
/// master axis samples in picometres.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub counter: u32,
    pub samples: Vec<i32>,
}

/// Frame size in bytes for a sample interval, per the device's sizing rule:
/// samples are batched 25 interval ticks per frame, capped at 1023.
pub fn frame_len(interval_us: u32) -> usize {
    let samples = (1_000_000 / u64::from(interval_us).max(1) / 25).clamp(1, 1023) as usize;
    (samples + 3) * 4
}

pub fn parse_frame(bytes: &[u8]) -> Result<StreamFrame> {
    ensure!(
        bytes.len() >= 16 && bytes.len() % 4 == 0,
        "malformed stream frame of {} bytes",
        bytes.len()
    );
    let word = |i: usize| -> [u8; 4] {
        let mut w = [0u8; 4];
        w.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
        w
    };
    let counter = u32::from_le_bytes(word(2));
    let samples = (3..bytes.len() / 4)
        .map(|i| i32::from_le_bytes(word(i)))
        .collect();
    Ok(StreamFrame { counter, samples })
}

pub struct DisplacementStream<R = TcpStream> {
    reader: R,
    frame_len: usize,
}

impl DisplacementStream<TcpStream> {
    /// Connect to the streaming port and subscribe the given axis.
    pub async fn open(host: &str, port: u16, interval_us: u32, axis: u8) -> Result<Self> {
        let mut stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("displacement stream connect to {host}:{port} failed"))?;
        let subscribe = json!({ "interval_us": interval_us, "axis": axis });
        stream
            .write_all(format!("{subscribe}\n").as_bytes())
            .await
            .context("stream subscription failed")?;
        Ok(Self {
            reader: stream,
            frame_len: frame_len(interval_us),
        })
    }
}

impl<R: AsyncRead + Unpin + Send> DisplacementStream<R> {
    /// Wrap an already-open transport; used by tests.
    pub fn from_reader(reader: R, interval_us: u32) -> Self {
        Self {
            reader,
            frame_len: frame_len(interval_us),
        }
    }

    /// Read one raw frame.
    pub async fn read_raw(&mut self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.frame_len];
        self.reader
            .read_exact(&mut buf)
            .await
            .context("displacement stream closed")?;
        Ok(buf)
    }

    pub async fn read_frame(&mut self) -> Result<StreamFrame> {
        let raw = self.read_raw().await?;
        parse_frame(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockAdapter;

    fn options() -> IdsOptions {
        IdsOptions {
            stream_host: "127.0.0.1".to_string(),
            stream_port: 10004,
            interval_us: 1000,
            record_dir: std::env::temp_dir(),
            record_prefix: "ids".to_string(),
        }
    }

    fn scripted() -> (Ids3010, MockAdapter) {
        let mock = MockAdapter::new();
        mock.on_contains("getDeviceName", r#"{"result":["IDS3010/bench"]}"#);
        mock.on_contains("getMasterAxis", r#"{"result":[1]}"#);
        (
            Ids3010::new("interfero", Box::new(mock.clone()), options()),
            mock,
        )
    }

    #[tokio::test]
    async fn initialize_reads_name_axis_and_mode() {
        let (mut ids, mock) = scripted();
        mock.on_contains("getCurrentMode", r#"{"result":["system idle"]}"#);
        ids.initialize().await.unwrap();
        assert_eq!(ids.state(), InstrumentState::Idle);
        assert_eq!(ids.master_axis(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_stops_stale_measurement() {
        let (mut ids, mock) = scripted();
        mock.on_contains("getCurrentMode", r#"{"result":["measurement running"]}"#);
        mock.on_contains("getCurrentMode", r#"{"result":["system idle"]}"#);
        mock.on_contains("stopMeasurement", r#"{"result":[0]}"#);

        ids.initialize().await.unwrap();
        assert_eq!(ids.state(), InstrumentState::Idle);
        assert!(mock
            .sent()
            .iter()
            .any(|c| c.contains("stopMeasurement")));
    }

    #[tokio::test(start_paused = true)]
    async fn start_measurement_polls_until_running() {
        let (mut ids, mock) = scripted();
        mock.on_contains("getCurrentMode", r#"{"result":["system idle"]}"#);
        mock.on_contains("getCurrentMode", r#"{"result":["system idle"]}"#);
        mock.on_contains("getCurrentMode", r#"{"result":["measurement starting"]}"#);
        mock.on_contains("getCurrentMode", r#"{"result":["measurement running"]}"#);
        mock.on_contains("startMeasurement", r#"{"result":[0]}"#);

        ids.initialize().await.unwrap();
        ids.start_measurement().await.unwrap();
        assert_eq!(ids.state(), InstrumentState::Running);
    }

    #[tokio::test]
    async fn alignment_is_refused_outside_idle() {
        let (mut ids, mock) = scripted();
        mock.on_contains("getCurrentMode", r#"{"result":["system idle"]}"#);
        mock.on_contains("getCurrentMode", r#"{"result":["measurement running"]}"#);
        ids.initialize().await.unwrap();

        let err = ids.align().await.unwrap_err();
        assert!(err.to_string().contains("system idle"), "{err}");
    }

    #[tokio::test]
    async fn stop_alignment_requires_an_alignment_mode() {
        let (mut ids, mock) = scripted();
        mock.on_contains("getCurrentMode", r#"{"result":["system idle"]}"#);
        ids.initialize().await.unwrap();

        let err = ids.stop_alignment().await.unwrap_err();
        assert!(err.to_string().contains("no optics alignment"), "{err}");
    }

    #[tokio::test]
    async fn rpc_errors_are_translated() {
        let (mut ids, mock) = scripted();
        mock.on_contains("getCurrentMode", r#"{"result":["system idle"]}"#);
        mock.on_contains("startMeasurement", r#"{"result":[123]}"#);
        mock.on_contains("errorNumberToString", r#"{"result":["laser not stable"]}"#);
        ids.initialize().await.unwrap();

        let err = ids.start_measurement().await.unwrap_err();
        assert!(err.to_string().contains("laser not stable"), "{err}");
    }

    #[test]
    fn frame_len_follows_sizing_rule() {
        // 1 MHz sample clock batched by 25, capped at 1023 samples.
        assert_eq!(frame_len(1), (1023 + 3) * 4);
        assert_eq!(frame_len(1000), (40 + 3) * 4);
        assert_eq!(frame_len(1_000_000), (1 + 3) * 4);
    }

    #[test]
    fn frames_decode_counter_and_samples() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0xDEADBEEFu32.to_le_bytes()); // header
        bytes.extend_from_slice(&0u32.to_le_bytes()); // header
        bytes.extend_from_slice(&7u32.to_le_bytes()); // counter
        bytes.extend_from_slice(&(-42i32).to_le_bytes());
        bytes.extend_from_slice(&1337i32.to_le_bytes());

        let frame = parse_frame(&bytes).unwrap();
        assert_eq!(frame.counter, 7);
        assert_eq!(frame.samples, vec![-42, 1337]);
        assert!(parse_frame(&bytes[..8]).is_err());
    }

    #[tokio::test]
    async fn stream_reads_fixed_size_frames() {
        let (mut tx, rx) = tokio::io::duplex(4096);
        // interval 25000 us -> 1 sample + 3 overhead words = 16 byte frames
        let mut stream = DisplacementStream::from_reader(rx, 25_000);

        let mut frame = Vec::new();
        frame.extend_from_slice(&0u32.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());
        frame.extend_from_slice(&1u32.to_le_bytes());
        frame.extend_from_slice(&500i32.to_le_bytes());
        tx.write_all(&frame).await.unwrap();

        let decoded = stream.read_frame().await.unwrap();
        assert_eq!(decoded.counter, 1);
        assert_eq!(decoded.samples, vec![500]);
    }
}
