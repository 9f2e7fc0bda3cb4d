//! Hardware transport abstraction.
//!
//! Instrument drivers own a boxed [`HardwareAdapter`] and never touch sockets,
//! USB handles, or VISA sessions directly. This keeps every driver testable
//! against the scripted [`mock::MockAdapter`] and keeps blocking vendor I/O
//! confined to `spawn_blocking` inside the adapter that needs it.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub mod mock;
pub mod tcp;

#[cfg(feature = "instrument_usb")]
pub mod usb;

#[cfg(feature = "instrument_visa")]
pub mod visa;

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid adapter configuration: {0}")]
    ConfigError(String),

    #[error("Communication error: {0}")]
    CommunicationError(String),

    #[error("Operation timed out")]
    Timeout,
}

/// A byte/line transport to one physical device.
///
/// `send` transmits exactly the text it is given (adapters that frame lines
/// document their terminator); `query` transmits and waits for one reply.
#[async_trait]
pub trait HardwareAdapter: Send + Sync {
    /// Adapter kind, for logs ("usb", "tcp", "visa", "mock").
    fn name(&self) -> &str;

    /// Template configuration accepted by [`connect`](Self::connect).
    fn default_config(&self) -> Value;

    fn validate_config(&self, config: &Value) -> Result<(), AdapterError>;

    /// Open the transport. `config` overrides fields of the default config.
    async fn connect(&mut self, config: &Value) -> Result<(), AdapterError>;

    async fn disconnect(&mut self) -> Result<(), AdapterError>;

    async fn send(&mut self, command: &str) -> Result<(), AdapterError>;

    async fn query(&mut self, command: &str) -> Result<String, AdapterError>;
}
