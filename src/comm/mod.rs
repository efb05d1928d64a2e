//! # Communication Module
//!
//! Transport core shared by every link to the flight controller.
//!
//! This module handles:
//! - CRC-16/CCITT checksums
//! - SLIP framing with byte stuffing
//! - The packet header wire format
//! - The shared circular packet queue
//! - Frame validation on receive and frame building on transmit
//! - The communication manager and its queue-draining task

pub mod builder;
pub mod crc;
pub mod manager;
pub mod protocol;
pub mod queue;
pub mod receiver;
pub mod slip;
