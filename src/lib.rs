//! Headless control and logging for a three-instrument optical bench:
//! a NewFocus 8742 picomotor controller (USB), an Attocube IDS3010
//! interferometer (Ethernet JSON-RPC plus a binary displacement stream) and
//! an Agilent E3631A power supply (VISA/SCPI).
//!
//! Layering, outermost first:
//! - [`run`]: cycle runners (repeated motor moves, voltage ladders) with
//!   per-iteration sample logging and cooperative cancellation
//! - [`instrument`]: one driver per device, programmed against the
//!   capability traits in [`core`]
//! - [`hardware`]: the transport seam (USB bulk, line-framed TCP, VISA,
//!   scripted mock)
//! - [`data`] / [`session`] / [`config`]: CSV and `.aws` output, session
//!   persistence, validated settings

pub mod config;
pub mod core;
pub mod data;
pub mod error;
pub mod hardware;
pub mod instrument;
pub mod protocol;
pub mod run;
pub mod session;
pub mod worker;

pub use error::{AppResult, ControlError};
