//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{FlightLinkError, Result};
use crate::interface::MAX_INTERFACES;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub queue: QueueConfig,
    pub manager: ManagerConfig,
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
    pub telemetry: TelemetryConfig,
    pub logging: LoggingConfig,
}

/// Packet queue configuration
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

/// Communication manager configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ManagerConfig {
    #[serde(default = "default_max_interfaces")]
    pub max_interfaces: usize,

    /// 0 disables the heartbeat
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

/// One physical link
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InterfaceConfig {
    Uart {
        #[serde(default)]
        name: Option<String>,

        port: String,

        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    Udp {
        #[serde(default)]
        name: Option<String>,

        bind: String,

        #[serde(default)]
        remote: Option<String>,
    },
}

impl InterfaceConfig {
    /// Name used in logs, falling back to the device or bind address
    pub fn name(&self) -> String {
        match self {
            InterfaceConfig::Uart { name, port, .. } => name.clone().unwrap_or_else(|| port.clone()),
            InterfaceConfig::Udp { name, bind, .. } => name.clone().unwrap_or_else(|| format!("udp:{}", bind)),
        }
    }
}

/// Packet log configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default = "default_telemetry_enabled")]
    pub enabled: bool,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_max_records_per_file")]
    pub max_records_per_file: usize,

    #[serde(default = "default_max_files_to_keep")]
    pub max_files_to_keep: usize,
}

/// Diagnostic logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Daily rolling log files are written here when set
    #[serde(default)]
    pub log_dir: Option<String>,
}

// Default value functions
fn default_buffer_size() -> usize { 4096 }

fn default_max_interfaces() -> usize { 4 }
fn default_heartbeat_interval_ms() -> u64 { 1000 }

fn default_baud_rate() -> u32 { 115200 }

fn default_telemetry_enabled() -> bool { true }
fn default_log_dir() -> String { "./logs".to_string() }
fn default_max_records_per_file() -> usize { 10000 }
fn default_max_files_to_keep() -> usize { 10 }

fn default_log_level() -> String { "info".to_string() }

const MIN_BUFFER_SIZE: usize = 64;
const MAX_BUFFER_SIZE: usize = 1_048_576;
const VALID_BAUD_RATES: [u32; 7] = [9600, 19200, 38400, 57600, 115200, 460800, 921600];
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

fn invalid(msg: impl std::fmt::Display) -> FlightLinkError {
    FlightLinkError::Config(toml::de::Error::custom(msg))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use flightlink::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    fn validate(&self) -> Result<()> {
        if self.queue.buffer_size < MIN_BUFFER_SIZE || self.queue.buffer_size > MAX_BUFFER_SIZE {
            return Err(invalid(format!(
                "buffer_size must be between {} and {}",
                MIN_BUFFER_SIZE, MAX_BUFFER_SIZE
            )));
        }

        if self.manager.max_interfaces == 0 || self.manager.max_interfaces > MAX_INTERFACES {
            return Err(invalid(format!("max_interfaces must be between 1 and {}", MAX_INTERFACES)));
        }

        if self.interfaces.len() > self.manager.max_interfaces {
            return Err(invalid(format!(
                "{} interfaces configured but max_interfaces is {}",
                self.interfaces.len(),
                self.manager.max_interfaces
            )));
        }

        // 0 disables the heartbeat
        if self.manager.heartbeat_interval_ms != 0
            && (self.manager.heartbeat_interval_ms < 10 || self.manager.heartbeat_interval_ms > 60000)
        {
            return Err(invalid("heartbeat_interval_ms must be 0 or between 10 and 60000"));
        }

        for interface in &self.interfaces {
            match interface {
                InterfaceConfig::Uart { port, baud_rate, .. } => {
                    if port.is_empty() {
                        return Err(invalid("uart port cannot be empty"));
                    }
                    if !VALID_BAUD_RATES.contains(baud_rate) {
                        return Err(invalid(format!("baud_rate must be one of: {:?}", VALID_BAUD_RATES)));
                    }
                }
                InterfaceConfig::Udp { bind, remote, .. } => {
                    if bind.parse::<SocketAddr>().is_err() {
                        return Err(invalid(format!("invalid udp bind address '{}'", bind)));
                    }
                    if let Some(remote) = remote {
                        if remote.parse::<SocketAddr>().is_err() {
                            return Err(invalid(format!("invalid udp remote address '{}'", remote)));
                        }
                    }
                }
            }
        }

        if self.telemetry.enabled && self.telemetry.log_dir.is_empty() {
            return Err(invalid("telemetry log_dir cannot be empty when enabled"));
        }

        if self.telemetry.max_records_per_file == 0 {
            return Err(invalid("max_records_per_file must be greater than 0"));
        }

        if self.telemetry.max_files_to_keep == 0 {
            return Err(invalid("max_files_to_keep must be greater than 0"));
        }

        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(invalid(format!("log level must be one of: {}", VALID_LOG_LEVELS.join(", "))));
        }

        Ok(())
    }
}
