//! Configuration system using Figment
//!
//! Configuration is layered, lowest to highest precedence:
//! 1. Built-in defaults (every section is `#[serde(default)]`)
//! 2. A TOML file (`config/chamber.toml` unless another path is given)
//! 3. Environment variables prefixed with `CHAMBER_`
//!
//! Nested keys are separated by a double underscore in environment variables:
//!
//! ```text
//! CHAMBER_INSTRUMENT__ADDRESS="GPIB0::12::INSTR"
//! CHAMBER_POLLER__TICK_INTERVAL_MS=250
//! CHAMBER_APPLICATION__LOG_LEVEL=debug
//! ```
//!
//! # Example
//!
//! ```no_run
//! use chamber_daq::config::Settings;
//!
//! let settings = Settings::load_from("config/chamber.toml")?;
//! println!("Instrument at {}", settings.instrument.address);
//! # Ok::<(), chamber_daq::config::ConfigError>(())
//! ```

use crate::program::{AbortStrategy, RampProgram};
use crate::protocol::TemperatureLimits;
use crate::telemetry::RetentionPolicy;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/chamber.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or deserialized
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// Values loaded but failed validation
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Instrument connection settings
    pub instrument: InstrumentConfig,
    /// Temperature limits sent with every constant set point
    pub limits: TemperatureLimits,
    /// Telemetry poller cadence and retention
    pub poller: PollerConfig,
    /// Durable telemetry log destination
    pub storage: StorageConfig,
    /// Ramp program authored by the "create ramp" action
    pub program: ProgramConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Transport back-end used to reach the instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// RS-232 through the `serialport` crate
    Serial,
    /// GPIB/USB/LAN through a VISA library; needs the `instrument_visa` feature
    Visa,
    /// In-process instrument model, no hardware
    Simulated,
}

/// Instrument connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Instrument address, passed verbatim to the transport
    pub address: String,
    /// Which transport back-end opens the address
    pub transport: TransportKind,
    /// Baud rate for the serial back-end
    pub baud_rate: u32,
    /// Terminator appended to every outgoing line
    pub line_terminator: String,
    /// Upper bound on opening the transport
    pub connect_timeout_ms: u64,
    /// Delay between writing a line and reading its reply
    pub settle_delay_ms: u64,
    /// Upper bound on a single read
    pub read_timeout_ms: u64,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            address: "GPIB0::10::INSTR".to_string(),
            transport: TransportKind::Visa,
            baud_rate: 9600,
            line_terminator: "\r\n".to_string(),
            connect_timeout_ms: 5000,
            settle_delay_ms: 500,
            read_timeout_ms: 5000,
        }
    }
}

impl InstrumentConfig {
    /// Connect timeout as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Settle delay as a `Duration`
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Read timeout as a `Duration`
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Telemetry poller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Sleep between ticks in milliseconds
    pub tick_interval_ms: u64,
    /// Retain every Nth tick while a program runs
    pub run_retain_every: u64,
    /// Retain every Nth tick in any other mode
    pub idle_retain_every: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        let policy = RetentionPolicy::default();
        Self {
            tick_interval_ms: 300,
            run_retain_every: policy.run_every,
            idle_retain_every: policy.idle_every,
        }
    }
}

impl PollerConfig {
    /// Tick interval as a `Duration`
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Retention policy described by this section
    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            run_every: self.run_retain_every,
            idle_every: self.idle_retain_every,
        }
    }
}

/// Storage configuration for the telemetry log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory receiving the log file
    pub output_dir: PathBuf,
    /// File name; `{timestamp}` expands to the session start time
    pub file_name: String,
    /// strftime format of the `Time` column
    pub time_format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            file_name: "temp_chamber_results.csv".to_string(),
            time_format: "%H:%M:%S".to_string(),
        }
    }
}

impl StorageConfig {
    /// Full path of the log file for a session started at `started`.
    pub fn log_path(&self, started: chrono::DateTime<chrono::Local>) -> PathBuf {
        let stamp = started.format("%Y%m%d_%H%M%S").to_string();
        self.output_dir
            .join(self.file_name.replace("{timestamp}", &stamp))
    }
}

/// Ramp program authoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramConfig {
    /// How an aborted edit envelope is closed
    pub abort_strategy: AbortStrategy,
    /// Highest program slot the instrument accepts
    pub max_slot: u8,
    /// Profile written by "create ramp"
    pub profile: RampProgram,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            abort_strategy: AbortStrategy::default(),
            max_slot: 40,
            profile: RampProgram::default(),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from the default file and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CHAMBER_").split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse configuration from a TOML string layered over the defaults
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let settings: Self = Figment::new()
            .merge(Toml::string(content))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Address is non-empty
    /// - Retention intervals are non-zero
    /// - Limits are ordered
    /// - The configured ramp profile is well formed
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.instrument.address.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "instrument.address cannot be empty".to_string(),
            ));
        }

        if self.poller.run_retain_every == 0 || self.poller.idle_retain_every == 0 {
            return Err(ConfigError::ValidationError(
                "poller retention intervals must be at least 1".to_string(),
            ));
        }

        if self.limits.low >= self.limits.high {
            return Err(ConfigError::ValidationError(format!(
                "limits.low ({}) must be below limits.high ({})",
                self.limits.low, self.limits.high
            )));
        }

        if self.program.max_slot == 0 {
            return Err(ConfigError::ValidationError(
                "program.max_slot must be at least 1".to_string(),
            ));
        }

        self.program
            .profile
            .validate()
            .map_err(|e| ConfigError::ValidationError(format!("program.profile: {}", e)))?;

        Ok(())
    }
}
