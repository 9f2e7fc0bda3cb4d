//! Bench configuration.
//!
//! Settings load from `config/{name}.json` (default `config/default.json`)
//! and are validated once at startup; drivers and runners receive plain
//! values and never re-check the file.

use config::Config;
use serde::Deserialize;

use crate::error::{AppResult, ControlError};
use crate::instrument::supply::Rail;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub log_level: String,
    pub motor: MotorSettings,
    pub interferometer: InterferometerSettings,
    pub supply: SupplySettings,
    pub storage: StorageSettings,
    /// Motor session file, relative to the working directory.
    pub session_file: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MotorSettings {
    /// USB ids as hex strings ("0x104d").
    pub vendor_id: String,
    pub product_id: String,
    pub max_cycles: u32,
    /// Smallest allowed dwell between moves, seconds.
    pub min_dwell_secs: f64,
    pub max_velocity: u32,
    pub max_acceleration: u32,
    pub record_prefix: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InterferometerSettings {
    pub host: String,
    pub rpc_port: u16,
    pub stream_port: u16,
    /// Displacement sample interval, microseconds.
    pub interval_us: u32,
    pub record_prefix: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupplySettings {
    /// VISA resource string ("GPIB0::5::INSTR").
    pub resource: String,
    /// Rail label ("+25 V", "-25 V", "+6 V").
    pub rail: String,
    pub volt_min: f64,
    pub volt_max: f64,
    pub volt_step: f64,
    pub dwell_secs: f64,
    pub dwell_low_secs: f64,
    pub current_limit_amps: f64,
    /// Voltage increment used by `supply-jog --up/--down`.
    pub jog_step: f64,
    pub record_prefix: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    pub record_dir: String,
}

fn parse_usb_id(label: &str, value: &str) -> AppResult<u16> {
    let s = value.trim();
    let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (s, 10),
    };
    u16::from_str_radix(digits, radix)
        .map_err(|_| ControlError::ConfigValidation(format!("invalid {label} '{value}'")))
}

impl Settings {
    pub fn new(config_name: Option<&str>) -> AppResult<Self> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Config::builder()
            .add_source(config::File::with_name(&config_path))
            .build()?;
        let settings: Settings = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a JSON string (tests, embedded defaults).
    pub fn from_json(json: &str) -> AppResult<Self> {
        let s = Config::builder()
            .add_source(config::File::from_str(json, config::FileFormat::Json))
            .build()?;
        let settings: Settings = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn motor_vendor_id(&self) -> AppResult<u16> {
        parse_usb_id("motor.vendor_id", &self.motor.vendor_id)
    }

    pub fn motor_product_id(&self) -> AppResult<u16> {
        parse_usb_id("motor.product_id", &self.motor.product_id)
    }

    pub fn supply_rail(&self) -> AppResult<Rail> {
        Rail::parse(&self.supply.rail)
            .map_err(|e| ControlError::ConfigValidation(e.to_string()))
    }

    pub fn validate(&self) -> AppResult<()> {
        fn invalid(message: String) -> ControlError {
            ControlError::ConfigValidation(message)
        }

        self.motor_vendor_id()?;
        self.motor_product_id()?;
        if self.motor.max_cycles == 0 {
            return Err(invalid("motor.max_cycles must be positive".to_string()));
        }
        if self.motor.min_dwell_secs < 0.0 {
            return Err(invalid("motor.min_dwell_secs must not be negative".to_string()));
        }
        if self.motor.max_velocity == 0 || self.motor.max_acceleration == 0 {
            return Err(invalid(
                "motor velocity/acceleration limits must be positive".to_string(),
            ));
        }

        if self.interferometer.interval_us == 0 {
            return Err(invalid(
                "interferometer.interval_us must be positive".to_string(),
            ));
        }
        if self.interferometer.host.is_empty() {
            return Err(invalid("interferometer.host must be set".to_string()));
        }

        let rail = self.supply_rail()?;
        if self.supply.volt_min <= 0.0 {
            return Err(invalid("supply.volt_min must be positive".to_string()));
        }
        if self.supply.volt_max < self.supply.volt_min {
            return Err(invalid(format!(
                "supply.volt_max ({}) below volt_min ({})",
                self.supply.volt_max, self.supply.volt_min
            )));
        }
        if self.supply.volt_max > rail.limit() {
            return Err(invalid(format!(
                "supply.volt_max ({}) exceeds the {} rail limit of {} V",
                self.supply.volt_max,
                rail.scpi(),
                rail.limit()
            )));
        }
        if self.supply.volt_step <= 0.0 || self.supply.jog_step <= 0.0 {
            return Err(invalid("supply voltage steps must be positive".to_string()));
        }
        if self.supply.current_limit_amps <= 0.0 {
            return Err(invalid(
                "supply.current_limit_amps must be positive".to_string(),
            ));
        }

        if self.storage.record_dir.is_empty() {
            return Err(invalid("storage.record_dir must be set".to_string()));
        }
        if self.session_file.is_empty() {
            return Err(invalid("session_file must be set".to_string()));
        }
        Ok(())
    }
}
