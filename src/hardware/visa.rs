//! VISA adapter (`instrument_visa` feature).
//!
//! SCPI over any VISA transport (GPIB in this bench's case). visa-rs sessions
//! are blocking `io::Read`/`io::Write`, so all I/O runs under `spawn_blocking`.

use std::ffi::CString;
use std::io::{BufRead, BufReader, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::task;
use visa_rs::prelude::*;

use super::{AdapterError, HardwareAdapter};

/// Keeps the resource manager alive alongside the session; dropping the
/// manager closes every session it opened.
struct VisaSession {
    _rm: DefaultRM,
    instrument: Instrument,
}

pub struct VisaAdapter {
    resource: String,
    timeout: Duration,
    session: Option<Arc<Mutex<VisaSession>>>,
}

impl VisaAdapter {
    /// `resource` is a VISA resource string, e.g. "GPIB0::5::INSTR".
    pub fn new(resource: &str) -> Self {
        Self {
            resource: resource.to_string(),
            timeout: Duration::from_secs(2),
            session: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn session(&self) -> Result<Arc<Mutex<VisaSession>>, AdapterError> {
        self.session.clone().ok_or(AdapterError::NotConnected)
    }
}

fn open_session(resource: &str, timeout: Duration) -> Result<VisaSession, AdapterError> {
    let rm = DefaultRM::new()
        .map_err(|e| AdapterError::ConnectionFailed(format!("resource manager: {e}")))?;
    let name = CString::new(resource)
        .map_err(|_| AdapterError::ConfigError(format!("invalid resource string: {resource}")))?;
    let instrument = rm
        .open(&name.into(), AccessMode::NO_LOCK, timeout)
        .map_err(|e| AdapterError::ConnectionFailed(format!("{resource}: {e}")))?;
    Ok(VisaSession {
        _rm: rm,
        instrument,
    })
}

fn blocking_write(session: &Mutex<VisaSession>, line: &str) -> Result<(), AdapterError> {
    let mut guard = session
        .lock()
        .map_err(|_| AdapterError::CommunicationError("visa session poisoned".to_string()))?;
    guard
        .instrument
        .write_all(line.as_bytes())
        .map_err(|e| AdapterError::CommunicationError(format!("visa write: {e}")))
}

fn blocking_read_line(session: &Mutex<VisaSession>) -> Result<String, AdapterError> {
    let guard = session
        .lock()
        .map_err(|_| AdapterError::CommunicationError("visa session poisoned".to_string()))?;
    let mut reader = BufReader::new(&guard.instrument);
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .map_err(|e| AdapterError::CommunicationError(format!("visa read: {e}")))?;
    Ok(line.trim_end().to_string())
}

fn terminated(command: &str) -> String {
    if command.ends_with('\n') {
        command.to_string()
    } else {
        format!("{command}\n")
    }
}

#[async_trait]
impl HardwareAdapter for VisaAdapter {
    fn name(&self) -> &str {
        "visa"
    }

    fn default_config(&self) -> Value {
        json!({
            "resource": self.resource,
            "timeout_ms": self.timeout.as_millis() as u64,
        })
    }

    fn validate_config(&self, config: &Value) -> Result<(), AdapterError> {
        if !config.is_object() && !config.is_null() {
            return Err(AdapterError::ConfigError(
                "visa adapter config must be an object".to_string(),
            ));
        }
        if let Some(resource) = config.get("resource") {
            if resource.as_str().filter(|s| !s.is_empty()).is_none() {
                return Err(AdapterError::ConfigError(format!(
                    "invalid resource: {resource}"
                )));
            }
        }
        Ok(())
    }

    async fn connect(&mut self, config: &Value) -> Result<(), AdapterError> {
        self.validate_config(config)?;
        if let Some(resource) = config.get("resource").and_then(Value::as_str) {
            self.resource = resource.to_string();
        }
        if let Some(ms) = config.get("timeout_ms").and_then(Value::as_u64) {
            self.timeout = Duration::from_millis(ms);
        }

        let resource = self.resource.clone();
        let timeout = self.timeout;
        let session = task::spawn_blocking(move || open_session(&resource, timeout))
            .await
            .map_err(|e| AdapterError::CommunicationError(e.to_string()))??;
        log::info!("visa adapter opened '{}'", self.resource);
        self.session = Some(Arc::new(Mutex::new(session)));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), AdapterError> {
        self.session = None;
        Ok(())
    }

    async fn send(&mut self, command: &str) -> Result<(), AdapterError> {
        let session = self.session()?;
        let line = terminated(command);
        task::spawn_blocking(move || blocking_write(&session, &line))
            .await
            .map_err(|e| AdapterError::CommunicationError(e.to_string()))?
    }

    async fn query(&mut self, command: &str) -> Result<String, AdapterError> {
        let session = self.session()?;
        let line = terminated(command);
        task::spawn_blocking(move || {
            blocking_write(&session, &line)?;
            blocking_read_line(&session)
        })
        .await
        .map_err(|e| AdapterError::CommunicationError(e.to_string()))?
    }
}
