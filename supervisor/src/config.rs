/*!
Configuration management for the DUT supervisor.
*/

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use anyhow::{Context, Result};

use crate::channel::SerialSettings;
use crate::supervisor::EchoMode;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub dut: DutConfig,
    pub instrument: InstrumentConfig,
    pub interlock: InterlockConfig,
    pub log: LogConfig,
}

impl AppConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self {
            dut: DutConfig::default(),
            instrument: InstrumentConfig::default(),
            interlock: InterlockConfig::default(),
            log: LogConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse config file as TOML")?;
        config.interlock.timeout()?;

        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise.
    ///
    /// A file that exists but does not parse is an error, never a silent
    /// fallback to defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if !path.as_ref().exists() {
            return Ok(Self::new());
        }
        Self::load_from_file(path)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Serial link to the DUT test board
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DutConfig {
    /// Serial port name (e.g. "/dev/ttyACM0", "COM5")
    pub port: String,

    /// Baud rate
    pub baud_rate: u32,

    /// Line read timeout in milliseconds; an expired read just means no frame yet
    pub read_timeout_ms: u64,
}

impl DutConfig {
    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings {
            port: self.port.clone(),
            baud_rate: self.baud_rate,
            timeout: Duration::from_millis(self.read_timeout_ms),
        }
    }
}

impl Default for DutConfig {
    fn default() -> Self {
        Self {
            port: "COM5".to_string(),
            baud_rate: 115200,
            read_timeout_ms: 1000,
        }
    }
}

/// Serial link to the bench power supply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Serial port name
    pub port: String,

    /// Baud rate
    pub baud_rate: u32,

    /// Response timeout in milliseconds
    pub read_timeout_ms: u64,

    /// Supply channel powering the DUT (0-based)
    pub channel: usize,
}

impl InstrumentConfig {
    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings {
            port: self.port.clone(),
            baud_rate: self.baud_rate,
            timeout: Duration::from_millis(self.read_timeout_ms),
        }
    }
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            port: "COM3".to_string(),
            baud_rate: 9600,
            read_timeout_ms: 1000,
            channel: 0,
        }
    }
}

/// Control-system points
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterlockConfig {
    /// Point read once at startup to prove the control system is reachable
    pub probe_point: String,

    /// Interlock open/closed readback
    pub monitor_point: String,

    /// Interlock open/close command
    pub command_point: String,

    /// Value written to the command point to close the interlock
    pub closed_value: String,

    /// Per-request timeout in seconds
    pub timeout_seconds: f64,

    /// Actually write the command point on a DUT fault (otherwise only log the intent)
    pub protective_write_enabled: bool,
}

impl InterlockConfig {
    /// Per-request timeout; rejects negative, NaN and out-of-range values
    pub fn timeout(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(self.timeout_seconds).with_context(|| {
            format!("Invalid interlock timeout_seconds: {}", self.timeout_seconds)
        })
    }
}

impl Default for InterlockConfig {
    fn default() -> Self {
        Self {
            probe_point: "SR08ID01DAQ03:Measure".to_string(),
            monitor_point: "SR08ID01IS01:SHUTTEROPEN_MONITOR".to_string(),
            command_point: "SR08ID01IS01:SHUTTEROPEN_CMD".to_string(),
            closed_value: "0".to_string(),
            timeout_seconds: 1.0,
            protective_write_enabled: false,
        }
    }
}

/// Record output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Append-only record file
    pub output_file: String,

    /// Frames buffered between the DUT reader and the decision loop
    pub frame_queue_capacity: usize,

    /// Console echo of each record: "summary", "json" or "off"
    pub echo: EchoMode,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            output_file: "output_file.txt".to_string(),
            frame_queue_capacity: 64,
            echo: EchoMode::Summary,
        }
    }
}
