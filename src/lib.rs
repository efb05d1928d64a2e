//! # FlightLink Library
//!
//! Communication core for a flight controller.
//!
//! Packets from every physical link (UART, UDP, ...) are SLIP framed with a
//! CRC-16 trailer, validated on receive and staged in one shared circular
//! packet queue. A single manager task drains the queue, dispatching inbound
//! packets to handlers and framing outbound packets onto their interface.

pub mod comm;
pub mod config;
pub mod error;
pub mod interface;
pub mod telemetry;
