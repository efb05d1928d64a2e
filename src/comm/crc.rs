//! # CRC-16/CCITT Implementation
//!
//! CRC-16/CCITT checksum calculation for framed packets.
//!
//! **Polynomial**: 0x1021 (x^16 + x^12 + x^5 + 1)
//! **Initial Value**: 0xFFFF (seeded by the caller)
//!
//! The update step is the XModem one (MSB first, no reflection, no final XOR),
//! so independently implemented peers produce bit-identical checksums.

/// CRC-16/CCITT polynomial
const CRC16_POLY: u16 = 0x1021;

/// Accumulator seed used at the start of every packet
pub const CRC16_INIT: u16 = 0xFFFF;

/// Precomputed CRC16 lookup table for fast calculation
const CRC16_TABLE: [u16; 256] = generate_crc16_table();

/// Generate CRC16 lookup table at compile time
const fn generate_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;

    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut j = 0;

        while j < 8 {
            if (crc & 0x8000) != 0 {
                crc = (crc << 1) ^ CRC16_POLY;
            } else {
                crc <<= 1;
            }
            j += 1;
        }

        table[i] = crc;
        i += 1;
    }

    table
}

/// Fold one byte into a running CRC-16/CCITT accumulator
///
/// # Arguments
///
/// * `crc` - Current accumulator value
/// * `byte` - Byte to fold in
///
/// # Returns
///
/// * `u16` - Updated accumulator
///
/// # Examples
///
/// ```
/// use flightlink::comm::crc::{crc16_calculate, CRC16_INIT};
///
/// let crc = b"123456789"
///     .iter()
///     .fold(CRC16_INIT, |acc, &b| crc16_calculate(acc, b));
/// assert_eq!(crc, 0x29B1);
/// ```
#[inline]
pub fn crc16_calculate(crc: u16, byte: u8) -> u16 {
    (crc << 8) ^ CRC16_TABLE[((crc >> 8) as u8 ^ byte) as usize]
}

/// Fold a whole block into a running CRC-16/CCITT accumulator
///
/// Equivalent to calling [`crc16_calculate`] for every byte of `data`.
pub fn crc16_calculate_for_block(crc: u16, data: &[u8]) -> u16 {
    data.iter().fold(crc, |acc, &byte| crc16_calculate(acc, byte))
}

/// Bitwise reference implementation (slow, for verification)
#[allow(dead_code)]
fn crc16_calculate_slow(mut crc: u16, byte: u8) -> u16 {
    crc ^= (byte as u16) << 8;

    for _ in 0..8 {
        if (crc & 0x8000) != 0 {
            crc = (crc << 1) ^ CRC16_POLY;
        } else {
            crc <<= 1;
        }
    }

    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_empty_block_returns_seed() {
        assert_eq!(crc16_calculate_for_block(CRC16_INIT, &[]), CRC16_INIT);
        assert_eq!(crc16_calculate_for_block(0x1234, &[]), 0x1234);
    }

    #[test]
    fn test_crc16_ccitt_false_check_value() {
        assert_eq!(crc16_calculate_for_block(CRC16_INIT, b"123456789"), 0x29B1);
    }

    #[test]
    fn test_crc16_xmodem_check_value() {
        // Same update step seeded with zero is CRC-16/XMODEM
        assert_eq!(crc16_calculate_for_block(0x0000, b"123456789"), 0x31C3);
    }

    #[test]
    fn test_crc16_lookup_table_matches_slow() {
        for seed in [0x0000u16, 0xFFFF, 0x1D0F, 0xA5A5] {
            for byte in 0..=255u8 {
                assert_eq!(
                    crc16_calculate(seed, byte),
                    crc16_calculate_slow(seed, byte),
                    "CRC mismatch for seed 0x{:04X}, byte 0x{:02X}",
                    seed,
                    byte
                );
            }
        }
    }

    #[test]
    fn test_crc16_block_equals_byte_fold() {
        let test_data = [
            vec![0x01, 0x02, 0x03],
            vec![0xC0, 0xDB, 0xDC, 0xDD],
            vec![0x00; 32],
            vec![0xFF; 17],
            (0..=255u8).collect::<Vec<_>>(),
        ];

        for data in test_data.iter() {
            for seed in [CRC16_INIT, 0x0000, 0x8408] {
                let folded = data.iter().fold(seed, |acc, &b| crc16_calculate(acc, b));
                assert_eq!(crc16_calculate_for_block(seed, data), folded);
            }
        }
    }

    #[test]
    fn test_crc16_block_is_incremental() {
        let data = b"flight controller telemetry";
        let (head, tail) = data.split_at(11);

        let whole = crc16_calculate_for_block(CRC16_INIT, data);
        let split = crc16_calculate_for_block(crc16_calculate_for_block(CRC16_INIT, head), tail);
        assert_eq!(whole, split);
    }

    #[test]
    fn test_crc16_changes_with_data() {
        let crc1 = crc16_calculate_for_block(CRC16_INIT, &[0x08, 0x01, 0x00, 0x04]);
        let crc2 = crc16_calculate_for_block(CRC16_INIT, &[0x08, 0x01, 0x00, 0x05]);
        assert_ne!(crc1, crc2, "CRC should change when data changes");
    }
}
