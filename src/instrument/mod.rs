//! Instrument drivers.
//!
//! Each driver owns a boxed [`crate::hardware::HardwareAdapter`] and exposes
//! the capability traits from [`crate::core`]. Drivers are transport-agnostic:
//! production wires them to USB/TCP/VISA adapters, tests to the mock.

pub mod ids3010;
pub mod picomotor;
pub mod supply;

pub use ids3010::Ids3010;
pub use picomotor::Picomotor;
pub use supply::AgilentE3631A;
