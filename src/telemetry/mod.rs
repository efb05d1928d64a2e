//! # Telemetry Module
//!
//! Handles packet logging to JSONL files with rotation.
//!
//! This module handles:
//! - Formatting inbound packets as JSONL (JSON Lines)
//! - Writing to rotating log files
//! - Managing file rotation (max N records per file)
//! - Retaining only last M files

pub mod logger;

pub use logger::{PacketLogger, PacketRecord};
