//! Cycle runners.
//!
//! Runners orchestrate instruments but never own them: they borrow a driver,
//! log three samples per iteration (before the change, after the change,
//! after the dwell), honor a [`crate::worker::CancelFlag`] once per
//! iteration, and leave instruments in a safe state on every exit path.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::Sign;

pub mod motor_cycle;
pub mod voltage_cycle;

pub use motor_cycle::{run_motor_cycle, MotorCycleParams, MotorCycleReport};
pub use voltage_cycle::{run_voltage_cycle, VoltageCycleParams, VoltageCycleReport};

/// Sweep direction. `UpDown` runs the up pass, then the down pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    UpDown,
}

impl Direction {
    pub fn signs(self) -> &'static [Sign] {
        match self {
            Direction::Up => &[Sign::Plus],
            Direction::Down => &[Sign::Minus],
            Direction::UpDown => &[Sign::Plus, Sign::Minus],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::UpDown => "updown",
        }
    }
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            "updown" => Ok(Direction::UpDown),
            other => Err(anyhow::anyhow!(
                "unknown direction '{other}' (expected up, down or updown)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directions_expand_to_sign_passes() {
        assert_eq!(Direction::Up.signs(), &[Sign::Plus]);
        assert_eq!(Direction::Down.signs(), &[Sign::Minus]);
        assert_eq!(Direction::UpDown.signs(), &[Sign::Plus, Sign::Minus]);
    }

    #[test]
    fn directions_round_trip_their_lowercase_names() {
        for direction in [Direction::Up, Direction::Down, Direction::UpDown] {
            assert_eq!(
                direction.as_str().parse::<Direction>().unwrap(),
                direction
            );
        }
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn directions_serialize_like_stored_sessions() {
        assert_eq!(
            serde_json::to_string(&Direction::UpDown).unwrap(),
            "\"updown\""
        );
        let parsed: Direction = serde_json::from_str("\"down\"").unwrap();
        assert_eq!(parsed, Direction::Down);
    }
}
