//! Data persistence: CSV sample logs and raw interferometer captures.

pub mod storage;
