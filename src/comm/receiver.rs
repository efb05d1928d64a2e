//! # Frame Receiver
//!
//! Turns a raw interface byte stream into validated packets: SLIP decoding,
//! then length and CRC checks. Everything that fails is counted and dropped.

use tracing::debug;

use super::protocol::{CRC_SIZE, HEADER_SIZE, MAX_PACKET_SIZE};
use super::slip::SlipDecoder;
use crate::error::{FlightLinkError, Result};

/// Receive-side counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    /// Frames completed by the SLIP decoder
    pub frames: u64,
    /// Frames that passed validation
    pub valid: u64,
    /// Frames with a bad CRC
    pub crc_errors: u64,
    /// Frames with a bad length
    pub malformed: u64,
    /// Partial frames dropped by the decoder (bad escape, overflow)
    pub decode_errors: u64,
}

/// Per-interface SLIP + CRC validation pipeline
pub struct FrameReceiver {
    decoder: SlipDecoder,
    stats: ReceiverStats,
}

impl Default for FrameReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReceiver {
    /// Create a receiver sized for the largest wire packet
    pub fn new() -> Self {
        Self {
            decoder: SlipDecoder::new(MAX_PACKET_SIZE),
            stats: ReceiverStats::default(),
        }
    }

    /// Feed one wire byte
    ///
    /// # Returns
    ///
    /// * `None` - No frame completed on this byte
    /// * `Some(Ok(packet))` - Header + payload of a valid frame (CRC stripped)
    /// * `Some(Err(_))` - A frame completed but failed validation
    pub fn feed_byte(&mut self, byte: u8) -> Option<Result<&[u8]>> {
        if !self.decoder.decode_byte(byte) {
            return None;
        }

        self.stats.frames += 1;
        Some(self.validate())
    }

    /// Feed a chunk of wire bytes, calling `on_packet` for every valid packet
    ///
    /// Invalid frames are logged at debug level and dropped.
    ///
    /// # Returns
    ///
    /// * `usize` - Number of valid packets delivered
    pub fn feed<F>(&mut self, data: &[u8], mut on_packet: F) -> usize
    where
        F: FnMut(&[u8]),
    {
        let mut delivered = 0;

        for &byte in data {
            match self.feed_byte(byte) {
                Some(Ok(packet)) => {
                    on_packet(packet);
                    delivered += 1;
                }
                Some(Err(e)) => debug!("Dropping frame: {}", e),
                None => {}
            }
        }

        delivered
    }

    /// Counter snapshot
    pub fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            decode_errors: self.decoder.errors() as u64,
            ..self.stats
        }
    }

    fn validate(&mut self) -> Result<&[u8]> {
        let frame = self.decoder.frame();

        if frame.len() < HEADER_SIZE + CRC_SIZE {
            self.stats.malformed += 1;
            return Err(FlightLinkError::MalformedFrame(format!(
                "Frame too short: {} bytes",
                frame.len()
            )));
        }

        if frame[0] as usize != frame.len() {
            self.stats.malformed += 1;
            return Err(FlightLinkError::MalformedFrame(format!(
                "Length field says {} bytes, decoded {}",
                frame[0],
                frame.len()
            )));
        }

        let crc_offset = frame.len() - CRC_SIZE;
        let received = u16::from_le_bytes([frame[crc_offset], frame[crc_offset + 1]]);
        let calculated = self.decoder.last_crc();

        if received != calculated {
            self.stats.crc_errors += 1;
            return Err(FlightLinkError::CrcMismatch {
                expected: calculated,
                actual: received,
            });
        }

        self.stats.valid += 1;
        Ok(&frame[..crc_offset])
    }
}
