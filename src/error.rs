//! # Error Types
//!
//! Custom error types for FlightLink using `thiserror`.
//!
//! Every variant is recoverable: the communication core drops the offending
//! packet and keeps running.

use thiserror::Error;

/// Main error type for FlightLink
#[derive(Debug, Error)]
pub enum FlightLinkError {
    /// No contiguous space left in the packet queue
    #[error("Packet queue full: no room for {requested} bytes")]
    QueueFull { requested: usize },

    /// Interface registration beyond capacity
    #[error("Interface table full (capacity {0})")]
    InterfaceTableFull(usize),

    /// Frame failed length or escape validation
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Frame CRC did not match its contents
    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Handle does not reference a valid slot
    #[error("Invalid packet handle at offset {0}")]
    InvalidHandle(usize),

    /// Interface index not registered
    #[error("Unknown interface index {0}")]
    UnknownInterface(u8),

    /// Packet can never fit the queue or the wire format
    #[error("Packet of {size} bytes exceeds maximum {max}")]
    PacketTooLarge { size: usize, max: usize },

    /// Transport-level send/receive failure
    #[error("Interface error: {0}")]
    Interface(String),

    /// Serial port errors
    #[error("Serial port error: {0}")]
    Serial(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Telemetry record serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for FlightLink
pub type Result<T> = std::result::Result<T, FlightLinkError>;
