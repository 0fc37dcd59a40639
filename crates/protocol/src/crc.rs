//! Checksums used on the wire.
//!
//! Outer frames and application packets carry a CRC-16/ARC trailer. The
//! application packet header additionally carries a CRC-8/SMBUS byte.

use crc::{Crc, CRC_16_ARC, CRC_8_SMBUS};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);
const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// CRC-16/ARC (reflected 0x8005, init 0).
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// CRC-8/SMBUS (0x07, init 0).
#[inline]
pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0xBB3D);
    }

    #[test]
    fn test_crc8_check_value() {
        assert_eq!(crc8(b"123456789"), 0xF4);
    }

    #[test]
    fn test_crc_of_empty_input() {
        assert_eq!(crc16(&[]), 0);
        assert_eq!(crc8(&[]), 0);
    }

    #[test]
    fn test_crc16_detects_single_bit_flip() {
        let data = b"\x5a\x5a\x10\x01\x05\x00abc".to_vec();
        let reference = crc16(&data);
        for i in 0..data.len() {
            for bit in 0..8 {
                let mut flipped = data.clone();
                flipped[i] ^= 1 << bit;
                assert_ne!(crc16(&flipped), reference, "byte {i} bit {bit}");
            }
        }
    }
}
