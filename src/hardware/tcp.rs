//! Line-framed TCP adapter.
//!
//! Used for the interferometer's JSON-RPC port: one request per line, one
//! reply per line, `\n` terminated.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{AdapterError, HardwareAdapter};

pub struct TcpLineAdapter {
    host: String,
    port: u16,
    read_timeout: Duration,
    reader: Option<BufReader<OwnedReadHalf>>,
    writer: Option<OwnedWriteHalf>,
}

impl TcpLineAdapter {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            read_timeout: Duration::from_secs(5),
            reader: None,
            writer: None,
        }
    }

    pub fn with_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    fn apply_overrides(&mut self, config: &Value) {
        if let Some(host) = config.get("host").and_then(Value::as_str) {
            self.host = host.to_string();
        }
        if let Some(port) = config.get("port").and_then(Value::as_u64) {
            self.port = port as u16;
        }
        if let Some(ms) = config.get("timeout_ms").and_then(Value::as_u64) {
            self.read_timeout = Duration::from_millis(ms);
        }
    }

    async fn write_line(&mut self, command: &str) -> Result<(), AdapterError> {
        let writer = self.writer.as_mut().ok_or(AdapterError::NotConnected)?;
        writer
            .write_all(command.as_bytes())
            .await
            .map_err(|e| AdapterError::CommunicationError(e.to_string()))?;
        if !command.ends_with('\n') {
            writer
                .write_all(b"\n")
                .await
                .map_err(|e| AdapterError::CommunicationError(e.to_string()))?;
        }
        writer
            .flush()
            .await
            .map_err(|e| AdapterError::CommunicationError(e.to_string()))
    }
}

#[async_trait]
impl HardwareAdapter for TcpLineAdapter {
    fn name(&self) -> &str {
        "tcp"
    }

    fn default_config(&self) -> Value {
        json!({
            "host": self.host,
            "port": self.port,
            "timeout_ms": self.read_timeout.as_millis() as u64,
        })
    }

    fn validate_config(&self, config: &Value) -> Result<(), AdapterError> {
        if !config.is_object() && !config.is_null() {
            return Err(AdapterError::ConfigError(
                "tcp adapter config must be an object".to_string(),
            ));
        }
        if let Some(port) = config.get("port") {
            if port.as_u64().filter(|p| *p > 0 && *p <= u64::from(u16::MAX)).is_none() {
                return Err(AdapterError::ConfigError(format!(
                    "invalid port: {port}"
                )));
            }
        }
        Ok(())
    }

    async fn connect(&mut self, config: &Value) -> Result<(), AdapterError> {
        self.validate_config(config)?;
        self.apply_overrides(config);

        let addr = format!("{}:{}", self.host, self.port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| AdapterError::ConnectionFailed(format!("{addr}: {e}")))?;
        let (read_half, write_half) = stream.into_split();
        self.reader = Some(BufReader::new(read_half));
        self.writer = Some(write_half);
        log::info!("tcp adapter connected to {}", addr);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), AdapterError> {
        self.reader = None;
        self.writer = None;
        Ok(())
    }

    async fn send(&mut self, command: &str) -> Result<(), AdapterError> {
        self.write_line(command).await
    }

    async fn query(&mut self, command: &str) -> Result<String, AdapterError> {
        self.write_line(command).await?;
        let reader = self.reader.as_mut().ok_or(AdapterError::NotConnected)?;

        let mut line = String::new();
        let n = timeout(self.read_timeout, reader.read_line(&mut line))
            .await
            .map_err(|_| AdapterError::Timeout)?
            .map_err(|e| AdapterError::CommunicationError(e.to_string()))?;
        if n == 0 {
            return Err(AdapterError::CommunicationError(
                "connection closed by peer".to_string(),
            ));
        }
        Ok(line.trim_end().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn queries_over_a_live_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line, "ping\n");
            write_half.write_all(b"pong\n").await.unwrap();
        });

        let mut adapter = TcpLineAdapter::new("127.0.0.1", port);
        adapter.connect(&json!({})).await.unwrap();
        assert_eq!(adapter.query("ping").await.unwrap(), "pong");
    }

    #[test]
    fn rejects_bad_port() {
        let adapter = TcpLineAdapter::new("localhost", 9090);
        assert!(adapter.validate_config(&json!({"port": 0})).is_err());
        assert!(adapter.validate_config(&json!({"port": 10004})).is_ok());
    }

    #[tokio::test]
    async fn query_times_out_on_silence() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let mut adapter =
            TcpLineAdapter::new("127.0.0.1", port).with_timeout(Duration::from_millis(50));
        adapter.connect(&json!({})).await.unwrap();
        assert!(matches!(
            adapter.query("ping").await,
            Err(AdapterError::Timeout)
        ));
    }
}
