//! # SLIP Codec
//!
//! SLIP (RFC 1055) byte framing with a CRC-16/CCITT accumulator folded in
//! alongside the escaping.
//!
//! The encoder writes into a caller-provided buffer and never allocates. The
//! decoder is a restartable state machine that owns one fixed-size destination
//! buffer and decodes an unbounded stream of back-to-back frames.

use super::crc::{crc16_calculate, CRC16_INIT};

/// SLIP END byte - marks frame boundaries
pub const SLIP_END: u8 = 0xC0;
/// SLIP ESC byte - escape character
pub const SLIP_ESC: u8 = 0xDB;
/// SLIP ESC_END - escaped form of END
pub const SLIP_ESC_END: u8 = 0xDC;
/// SLIP ESC_ESC - escaped form of ESC
pub const SLIP_ESC_ESC: u8 = 0xDD;

/// Worst-case encoded size of `len` payload bytes plus both delimiters
pub const fn max_encoded_len(len: usize) -> usize {
    len * 2 + 2
}

/// SLIP encoder writing into a borrowed buffer
///
/// No bounds checking is done per byte: size the target with
/// [`max_encoded_len`] before encoding. Writing past the end of the target is
/// a caller bug and panics on the slice index.
pub struct SlipEncoder<'a> {
    target: &'a mut [u8],
    position: usize,
    crc: u16,
}

impl<'a> SlipEncoder<'a> {
    /// Create an encoder at position 0 with a freshly seeded CRC
    pub fn new(target: &'a mut [u8]) -> Self {
        Self {
            target,
            position: 0,
            crc: CRC16_INIT,
        }
    }

    /// Append the escaped form of `byte` (1 or 2 bytes)
    ///
    /// Does not touch the CRC accumulator.
    #[inline]
    pub fn encode_byte(&mut self, byte: u8) {
        match byte {
            SLIP_END => {
                self.target[self.position] = SLIP_ESC;
                self.target[self.position + 1] = SLIP_ESC_END;
                self.position += 2;
            }
            SLIP_ESC => {
                self.target[self.position] = SLIP_ESC;
                self.target[self.position + 1] = SLIP_ESC_ESC;
                self.position += 2;
            }
            _ => {
                self.target[self.position] = byte;
                self.position += 1;
            }
        }
    }

    /// Encode every byte of `data` and fold it into the CRC accumulator
    ///
    /// The accumulator is not reset here; the caller decides which bytes the
    /// checksum spans.
    pub fn encode_block(&mut self, data: &[u8]) {
        for &byte in data {
            self.crc = crc16_calculate(self.crc, byte);
            self.encode_byte(byte);
        }
    }

    /// Append a raw END delimiter
    #[inline]
    pub fn encode_end(&mut self) {
        self.target[self.position] = SLIP_END;
        self.position += 1;
    }

    /// Current write position, i.e. the encoded length so far
    pub fn position(&self) -> usize {
        self.position
    }

    /// Current CRC accumulator
    pub fn crc(&self) -> u16 {
        self.crc
    }

    /// Reseed the CRC accumulator for a new packet
    pub fn reset_crc(&mut self) {
        self.crc = CRC16_INIT;
    }
}

/// Decoder phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    /// Waiting for an END to open a frame
    Idle,
    /// Collecting frame bytes
    InData,
    /// Previous byte was ESC
    InEscape,
}

/// Restartable SLIP decoder
///
/// Frames are opened by END. Inside a frame, an END after at least one data
/// byte completes the frame and opens the next one, so both "leading END only"
/// and "leading + trailing END" senders are understood.
///
/// An undefined escape sequence or a buffer overflow discards the partial
/// frame and returns to [`DecodeState::Idle`] until the next END.
pub struct SlipDecoder {
    state: DecodeState,
    buffer: Box<[u8]>,
    position: usize,
    crc: u16,
    last_packet_length: usize,
    last_crc: u16,
    errors: u32,
}

impl SlipDecoder {
    /// Create a decoder whose frames hold at most `capacity` decoded bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            state: DecodeState::Idle,
            buffer: vec![0u8; capacity].into_boxed_slice(),
            position: 0,
            crc: CRC16_INIT,
            last_packet_length: 0,
            last_crc: CRC16_INIT,
            errors: 0,
        }
    }

    /// Reset to `Idle`, dropping any partial frame
    pub fn initialize(&mut self) {
        self.state = DecodeState::Idle;
        self.position = 0;
        self.crc = CRC16_INIT;
    }

    /// Feed one wire byte
    ///
    /// # Returns
    ///
    /// * `bool` - `true` when this byte completed a frame; the frame is then
    ///   available from [`SlipDecoder::frame`] until the next call
    pub fn decode_byte(&mut self, byte: u8) -> bool {
        match self.state {
            DecodeState::Idle => {
                if byte == SLIP_END {
                    self.start_frame();
                }
                false
            }
            DecodeState::InData => match byte {
                SLIP_ESC => {
                    self.state = DecodeState::InEscape;
                    false
                }
                SLIP_END if self.position == 0 => false,
                SLIP_END => {
                    self.finish_frame();
                    true
                }
                _ => {
                    self.append(byte);
                    false
                }
            },
            DecodeState::InEscape => {
                match byte {
                    SLIP_ESC_END => {
                        self.state = DecodeState::InData;
                        self.append(SLIP_END);
                    }
                    SLIP_ESC_ESC => {
                        self.state = DecodeState::InData;
                        self.append(SLIP_ESC);
                    }
                    SLIP_END => {
                        // Sender aborted mid-escape; the END opens a fresh frame
                        self.errors = self.errors.wrapping_add(1);
                        self.start_frame();
                    }
                    _ => {
                        self.errors = self.errors.wrapping_add(1);
                        self.initialize();
                    }
                }
                false
            }
        }
    }

    /// Bytes of the last completed frame
    pub fn frame(&self) -> &[u8] {
        &self.buffer[..self.last_packet_length]
    }

    /// Length of the last completed frame
    pub fn last_packet_length(&self) -> usize {
        self.last_packet_length
    }

    /// CRC of the last completed frame, excluding its final two bytes
    ///
    /// Frames end with their own CRC, so this is the value to compare against
    /// those two bytes.
    pub fn last_crc(&self) -> u16 {
        self.last_crc
    }

    /// Current phase
    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Frames discarded for bad escapes or overflow
    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// Maximum decoded frame size
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    fn start_frame(&mut self) {
        self.state = DecodeState::InData;
        self.position = 0;
        self.crc = CRC16_INIT;
    }

    fn finish_frame(&mut self) {
        self.last_packet_length = self.position;
        self.last_crc = self.crc;
        self.position = 0;
        self.crc = CRC16_INIT;
    }

    fn append(&mut self, byte: u8) {
        if self.position == self.buffer.len() {
            self.errors = self.errors.wrapping_add(1);
            self.initialize();
            return;
        }

        self.buffer[self.position] = byte;
        // The accumulator trails by two bytes so it never covers the frame CRC
        if self.position >= 2 {
            self.crc = crc16_calculate(self.crc, self.buffer[self.position - 2]);
        }
        self.position += 1;
    }
}
