//! # Packet Builder
//!
//! Writes packet headers into queue slots and turns stored packets into SLIP
//! frames with a trailing CRC-16.

use super::protocol::{PacketHeader, PacketType, CRC_SIZE};
use super::queue::{PacketHandle, PacketQueue};
use super::slip::{max_encoded_len, SlipEncoder};
use crate::error::{FlightLinkError, Result};

/// Worst-case wire size of a packet of `packet_len` bytes (header + payload)
pub const fn max_frame_len(packet_len: usize) -> usize {
    max_encoded_len(packet_len + CRC_SIZE)
}

/// Write `header` at the start of a reserved slot
///
/// The slot must have been reserved for at least the header size.
pub fn write_header(queue: &PacketQueue, handle: PacketHandle, header: &PacketHeader) -> Result<()> {
    queue.store_bytes(handle, 0, &header.to_bytes())
}

/// Encode a stored packet (header + payload) into a wire frame
///
/// # Arguments
///
/// * `packet` - Header followed by payload
/// * `out` - Destination, at least [`max_frame_len`] bytes
///
/// # Returns
///
/// * `Result<usize>` - Encoded frame length
///
/// # Errors
///
/// Returns `PacketTooLarge` if `out` cannot hold the worst-case encoding
pub fn encode_frame(packet: &[u8], out: &mut [u8]) -> Result<usize> {
    let needed = max_frame_len(packet.len());
    if out.len() < needed {
        return Err(FlightLinkError::PacketTooLarge {
            size: needed,
            max: out.len(),
        });
    }

    let mut encoder = SlipEncoder::new(out);
    encoder.encode_end();
    encoder.encode_block(packet);

    // CRC goes out low byte first and is not part of its own checksum
    for byte in encoder.crc().to_le_bytes() {
        encoder.encode_byte(byte);
    }
    encoder.encode_end();

    Ok(encoder.position())
}

/// Build a complete wire frame for a payload
///
/// # Examples
///
/// ```
/// use flightlink::comm::builder::build_frame;
/// use flightlink::comm::protocol::PacketType;
///
/// let frame = build_frame(PacketType::Heartbeat, 1, &[])?;
/// assert_eq!(frame.first(), Some(&0xC0));
/// assert_eq!(frame.last(), Some(&0xC0));
/// # Ok::<(), flightlink::error::FlightLinkError>(())
/// ```
pub fn build_frame(packet_type: PacketType, counter: u8, payload: &[u8]) -> Result<Vec<u8>> {
    let header = PacketHeader::new(payload.len(), packet_type, counter)?;

    let mut packet = Vec::with_capacity(header.length as usize);
    packet.extend_from_slice(&header.to_bytes());
    packet.extend_from_slice(payload);

    let mut frame = vec![0u8; max_frame_len(packet.len())];
    let len = encode_frame(&packet, &mut frame)?;
    frame.truncate(len);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::crc::{crc16_calculate_for_block, CRC16_INIT};
    use crate::comm::protocol::HEADER_SIZE;
    use crate::comm::queue::Direction;
    use crate::comm::slip::{SlipDecoder, SLIP_END};

    fn decode(frame: &[u8]) -> Vec<u8> {
        let mut decoder = SlipDecoder::new(512);
        for &byte in frame {
            if decoder.decode_byte(byte) {
                return decoder.frame().to_vec();
            }
        }
        panic!("frame did not complete");
    }

    #[test]
    fn test_build_frame_layout() {
        let frame = build_frame(PacketType::Telemetry, 42, &[0x10, 0x20]).unwrap();
        assert_eq!(frame[0], SLIP_END);
        assert_eq!(*frame.last().unwrap(), SLIP_END);

        let packet = decode(&frame);
        assert_eq!(&packet[..HEADER_SIZE], &[7, 0x01, 42]);
        assert_eq!(&packet[HEADER_SIZE..5], &[0x10, 0x20]);

        let crc = crc16_calculate_for_block(CRC16_INIT, &packet[..5]);
        assert_eq!(&packet[5..], &crc.to_le_bytes());
    }

    #[test]
    fn test_build_frame_escapes_payload_and_crc() {
        let payload = [SLIP_END, 0xDB, SLIP_END];
        let frame = build_frame(PacketType::Command, 0xC0, &payload).unwrap();

        // Only the two delimiters may appear raw
        assert_eq!(frame.iter().filter(|&&b| b == SLIP_END).count(), 2);

        let packet = decode(&frame);
        assert_eq!(packet[2], 0xC0);
        assert_eq!(&packet[HEADER_SIZE..HEADER_SIZE + 3], &payload);
    }

    #[test]
    fn test_encode_frame_rejects_small_buffer() {
        let mut out = [0u8; 8];
        let result = encode_frame(&[1, 2, 3], &mut out);
        assert!(matches!(result, Err(FlightLinkError::PacketTooLarge { .. })));
    }

    #[test]
    fn test_max_frame_len() {
        // Every byte escaped plus two delimiters
        assert_eq!(max_frame_len(3), 12);
        assert_eq!(max_frame_len(0), 6);
    }

    #[test]
    fn test_write_header_into_slot() {
        let (queue, _consumer) = PacketQueue::new(64);
        let handle = queue.push_begin(HEADER_SIZE + 2, 1, Direction::Outbound).unwrap();
        let header = PacketHeader::new(2, PacketType::Configuration, 9).unwrap();

        write_header(&queue, handle, &header).unwrap();

        let mut stored = [0u8; HEADER_SIZE];
        queue.read_payload(handle, &mut stored).unwrap();
        assert_eq!(stored, [7, 0x03, 9]);
    }
}
