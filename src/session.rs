//! Motor session persistence.
//!
//! The last used cycle parameters are written to a small JSON file when the
//! application exits and restored when the motor connects, so a bench restart
//! picks up where the previous session stopped. The stored key names match
//! session files written by earlier versions of the bench software.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, ControlError};
use crate::run::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotorSession {
    pub number_of_steps: u32,
    pub number_of_cycles: u32,
    /// Dwell between moves, in seconds.
    pub dwell_time: f64,
    pub direction: Direction,
}

impl Default for MotorSession {
    fn default() -> Self {
        Self {
            number_of_steps: 100,
            number_of_cycles: 1,
            dwell_time: 1.0,
            direction: Direction::UpDown,
        }
    }
}

impl MotorSession {
    /// Load a session; a missing file yields `None`.
    pub fn load(path: &Path) -> AppResult<Option<Self>> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ControlError::Session(format!(
                    "cannot read {}: {e}",
                    path.display()
                )))
            }
        };
        let session = serde_json::from_str(&contents).map_err(|e| {
            ControlError::Session(format!("cannot parse {}: {e}", path.display()))
        })?;
        Ok(Some(session))
    }

    /// Load, falling back to defaults (with a warning) on missing or
    /// unreadable files. Motor connect must not fail because of a stale
    /// session.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(Some(session)) => session,
            Ok(None) => {
                log::info!("no session at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                log::warn!("ignoring session file: {e}");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        log::info!("session saved to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let session = MotorSession {
            number_of_steps: 250,
            number_of_cycles: 7,
            dwell_time: 2.5,
            direction: Direction::Down,
        };

        session.save(&path).unwrap();
        assert_eq!(MotorSession::load(&path).unwrap(), Some(session));
    }

    #[test]
    fn stored_keys_match_the_legacy_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        MotorSession::default().save(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        for key in [
            "number_of_steps",
            "number_of_cycles",
            "dwell_time",
            "direction",
        ] {
            assert!(raw.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(raw["direction"], "updown");
    }

    #[test]
    fn missing_file_is_none_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert_eq!(MotorSession::load(&path).unwrap(), None);
        assert_eq!(MotorSession::load_or_default(&path), MotorSession::default());
    }

    #[test]
    fn corrupt_file_is_an_error_but_defaults_survive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(MotorSession::load(&path).is_err());
        assert_eq!(MotorSession::load_or_default(&path), MotorSession::default());
    }
}
