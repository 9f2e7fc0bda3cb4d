//! Raw USB bulk adapter (`instrument_usb` feature).
//!
//! The picomotor controller enumerates as a vendor-specific device with one
//! bulk IN and one bulk OUT endpoint; commands and replies are plain ASCII.
//! `rusb` is blocking, so every transfer runs under `spawn_blocking`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusb::{Direction, GlobalContext, TransferType};
use serde_json::{json, Value};
use tokio::task;

use super::{AdapterError, HardwareAdapter};

const READ_BUFFER: usize = 512;

struct UsbDevice {
    handle: Mutex<rusb::DeviceHandle<GlobalContext>>,
    endpoint_out: u8,
    endpoint_in: u8,
}

pub struct UsbAdapter {
    vendor_id: u16,
    product_id: u16,
    io_timeout: Duration,
    device: Option<Arc<UsbDevice>>,
}

/// Accepts `0x104d`-style strings as well as plain numbers.
fn parse_id(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => {
            let s = s.trim();
            let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => (hex, 16),
                None => (s, 10),
            };
            u16::from_str_radix(digits, radix).ok()
        }
        _ => None,
    }
}

impl UsbAdapter {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            io_timeout: Duration::from_secs(2),
            device: None,
        }
    }

    fn apply_overrides(&mut self, config: &Value) {
        if let Some(id) = config.get("vendor_id").and_then(parse_id) {
            self.vendor_id = id;
        }
        if let Some(id) = config.get("product_id").and_then(parse_id) {
            self.product_id = id;
        }
        if let Some(ms) = config.get("timeout_ms").and_then(Value::as_u64) {
            self.io_timeout = Duration::from_millis(ms);
        }
    }

    fn device(&self) -> Result<Arc<UsbDevice>, AdapterError> {
        self.device.clone().ok_or(AdapterError::NotConnected)
    }
}

fn open_device(
    vendor_id: u16,
    product_id: u16,
) -> Result<UsbDevice, AdapterError> {
    let mut handle = rusb::open_device_with_vid_pid(vendor_id, product_id).ok_or_else(|| {
        AdapterError::ConnectionFailed(format!(
            "no USB device {vendor_id:04x}:{product_id:04x}"
        ))
    })?;

    let config = handle
        .device()
        .active_config_descriptor()
        .map_err(|e| AdapterError::ConnectionFailed(e.to_string()))?;

    let mut endpoint_out = None;
    let mut endpoint_in = None;
    for interface in config.interfaces() {
        for descriptor in interface.descriptors() {
            for endpoint in descriptor.endpoint_descriptors() {
                if endpoint.transfer_type() != TransferType::Bulk {
                    continue;
                }
                match endpoint.direction() {
                    Direction::Out => endpoint_out = Some(endpoint.address()),
                    Direction::In => endpoint_in = Some(endpoint.address()),
                }
            }
        }
    }
    let (endpoint_out, endpoint_in) = match (endpoint_out, endpoint_in) {
        (Some(o), Some(i)) => (o, i),
        _ => {
            return Err(AdapterError::ConnectionFailed(
                "device has no bulk endpoint pair".to_string(),
            ))
        }
    };

    handle
        .claim_interface(0)
        .map_err(|e| AdapterError::ConnectionFailed(format!("claim interface: {e}")))?;

    Ok(UsbDevice {
        handle: Mutex::new(handle),
        endpoint_out,
        endpoint_in,
    })
}

fn blocking_write(device: &UsbDevice, bytes: &[u8], timeout: Duration) -> Result<(), AdapterError> {
    let handle = device
        .handle
        .lock()
        .map_err(|_| AdapterError::CommunicationError("usb handle poisoned".to_string()))?;
    handle
        .write_bulk(device.endpoint_out, bytes, timeout)
        .map_err(|e| AdapterError::CommunicationError(format!("bulk write: {e}")))?;
    Ok(())
}

fn blocking_read(device: &UsbDevice, timeout: Duration) -> Result<String, AdapterError> {
    let handle = device
        .handle
        .lock()
        .map_err(|_| AdapterError::CommunicationError("usb handle poisoned".to_string()))?;
    let mut buf = [0u8; READ_BUFFER];
    let n = handle
        .read_bulk(device.endpoint_in, &mut buf, timeout)
        .map_err(|e| match e {
            rusb::Error::Timeout => AdapterError::Timeout,
            other => AdapterError::CommunicationError(format!("bulk read: {other}")),
        })?;
    Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
}

#[async_trait]
impl HardwareAdapter for UsbAdapter {
    fn name(&self) -> &str {
        "usb"
    }

    fn default_config(&self) -> Value {
        json!({
            "vendor_id": format!("0x{:04x}", self.vendor_id),
            "product_id": format!("0x{:04x}", self.product_id),
            "timeout_ms": self.io_timeout.as_millis() as u64,
        })
    }

    fn validate_config(&self, config: &Value) -> Result<(), AdapterError> {
        if !config.is_object() && !config.is_null() {
            return Err(AdapterError::ConfigError(
                "usb adapter config must be an object".to_string(),
            ));
        }
        for key in ["vendor_id", "product_id"] {
            if let Some(v) = config.get(key) {
                if parse_id(v).is_none() {
                    return Err(AdapterError::ConfigError(format!("invalid {key}: {v}")));
                }
            }
        }
        Ok(())
    }

    async fn connect(&mut self, config: &Value) -> Result<(), AdapterError> {
        self.validate_config(config)?;
        self.apply_overrides(config);

        let (vendor_id, product_id) = (self.vendor_id, self.product_id);
        let device = task::spawn_blocking(move || open_device(vendor_id, product_id))
            .await
            .map_err(|e| AdapterError::CommunicationError(e.to_string()))??;
        log::info!(
            "usb adapter opened {:04x}:{:04x} (out 0x{:02x}, in 0x{:02x})",
            vendor_id,
            product_id,
            device.endpoint_out,
            device.endpoint_in
        );
        self.device = Some(Arc::new(device));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), AdapterError> {
        self.device = None;
        Ok(())
    }

    async fn send(&mut self, command: &str) -> Result<(), AdapterError> {
        let device = self.device()?;
        let bytes = command.as_bytes().to_vec();
        let timeout = self.io_timeout;
        task::spawn_blocking(move || blocking_write(&device, &bytes, timeout))
            .await
            .map_err(|e| AdapterError::CommunicationError(e.to_string()))?
    }

    async fn query(&mut self, command: &str) -> Result<String, AdapterError> {
        let device = self.device()?;
        let bytes = command.as_bytes().to_vec();
        let timeout = self.io_timeout;
        task::spawn_blocking(move || {
            blocking_write(&device, &bytes, timeout)?;
            blocking_read(&device, timeout)
        })
        .await
        .map_err(|e| AdapterError::CommunicationError(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_and_decimal_ids() {
        assert_eq!(parse_id(&json!("0x104d")), Some(0x104d));
        assert_eq!(parse_id(&json!("0x4000")), Some(0x4000));
        assert_eq!(parse_id(&json!(4173)), Some(4173));
        assert_eq!(parse_id(&json!("garbage")), None);
        assert_eq!(parse_id(&json!(0x1_0000)), None);
    }

    #[test]
    fn validates_id_overrides() {
        let adapter = UsbAdapter::new(0x104d, 0x4000);
        assert!(adapter
            .validate_config(&json!({"vendor_id": "0x104d"}))
            .is_ok());
        assert!(adapter
            .validate_config(&json!({"product_id": "not-an-id"}))
            .is_err());
    }
}
