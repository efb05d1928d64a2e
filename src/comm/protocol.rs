//! # Wire Protocol Constants and Types
//!
//! Packet header layout shared by every interface:
//!
//! ```text
//! END | SLIP( [PacketLength:1][PacketType:1][PacketCounter:1][payload...][CRC lo][CRC hi] ) | END
//! ```
//!
//! `PacketLength` counts the header, the payload and the CRC.

use crate::error::{FlightLinkError, Result};

/// Header size (length + type + counter)
pub const HEADER_SIZE: usize = 3;

/// Trailing CRC-16 size
pub const CRC_SIZE: usize = 2;

/// Largest payload whose `PacketLength` still fits the one-byte length field
pub const MAX_PAYLOAD_SIZE: usize = u8::MAX as usize - HEADER_SIZE - CRC_SIZE;

/// Largest decoded frame (header + payload + CRC)
pub const MAX_PACKET_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE + CRC_SIZE;

/// Packet type carried in the second header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Link keep-alive
    Heartbeat,
    /// Vehicle telemetry
    Telemetry,
    /// File table transfer
    FileTransfer,
    /// Configuration read/write
    Configuration,
    /// Ground control command
    Command,
    /// Any type this core does not know about
    Unknown(u8),
}

impl PacketType {
    /// Wire value
    pub fn as_u8(self) -> u8 {
        match self {
            PacketType::Heartbeat => 0x00,
            PacketType::Telemetry => 0x01,
            PacketType::FileTransfer => 0x02,
            PacketType::Configuration => 0x03,
            PacketType::Command => 0x04,
            PacketType::Unknown(value) => value,
        }
    }
}

impl From<u8> for PacketType {
    fn from(value: u8) -> Self {
        match value {
            0x00 => PacketType::Heartbeat,
            0x01 => PacketType::Telemetry,
            0x02 => PacketType::FileTransfer,
            0x03 => PacketType::Configuration,
            0x04 => PacketType::Command,
            other => PacketType::Unknown(other),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(value: PacketType) -> Self {
        value.as_u8()
    }
}

/// Packet header as it appears on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Header + payload + CRC length
    pub length: u8,

    /// Packet type
    pub packet_type: PacketType,

    /// Shared transmit sequence counter
    pub counter: u8,
}

impl PacketHeader {
    /// Build a header for a payload of `payload_len` bytes
    ///
    /// # Errors
    ///
    /// Returns `PacketTooLarge` if the payload exceeds [`MAX_PAYLOAD_SIZE`]
    pub fn new(payload_len: usize, packet_type: PacketType, counter: u8) -> Result<Self> {
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(FlightLinkError::PacketTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        Ok(Self {
            length: (payload_len + HEADER_SIZE + CRC_SIZE) as u8,
            packet_type,
            counter,
        })
    }

    /// Payload length implied by the length field
    pub fn payload_len(&self) -> usize {
        (self.length as usize).saturating_sub(HEADER_SIZE + CRC_SIZE)
    }

    /// Serialize to the three header bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        [self.length, self.packet_type.as_u8(), self.counter]
    }

    /// Parse the header at the start of `data`
    ///
    /// # Errors
    ///
    /// Returns `MalformedFrame` if fewer than [`HEADER_SIZE`] bytes are given
    /// or the length field is smaller than an empty packet
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(FlightLinkError::MalformedFrame(format!(
                "Header too short: {} bytes",
                data.len()
            )));
        }

        if (data[0] as usize) < HEADER_SIZE + CRC_SIZE {
            return Err(FlightLinkError::MalformedFrame(format!(
                "Packet length {} below minimum {}",
                data[0],
                HEADER_SIZE + CRC_SIZE
            )));
        }

        Ok(Self {
            length: data[0],
            packet_type: PacketType::from(data[1]),
            counter: data[2],
        })
    }
}
