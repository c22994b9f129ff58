//! CRC-16/MODBUS
//!
//! Polynomial 0xA001 (reflected 0x8005), seed 0xFFFF, no final XOR.
//! Transmitted little-endian after the frame body.

use super::constants::{CRC16_INIT, CRC16_POLY, CRC_LEN};

/// Compute the Modbus CRC-16 of `data`
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = CRC16_INIT;

    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc >>= 1;
                crc ^= CRC16_POLY;
            } else {
                crc >>= 1;
            }
        }
    }

    crc
}

/// Split a frame into its body and the CRC it carries.
///
/// Returns `None` when the frame is too short to hold a CRC.
pub fn split_crc(frame: &[u8]) -> Option<(&[u8], u16)> {
    if frame.len() < CRC_LEN {
        return None;
    }
    let (body, tail) = frame.split_at(frame.len() - CRC_LEN);
    Some((body, u16::from_le_bytes([tail[0], tail[1]])))
}

/// Recompute the CRC over all but the trailing two bytes and compare.
///
/// Returns `(computed, received)` on mismatch.
pub fn verify(frame: &[u8]) -> Result<(), (u16, u16)> {
    match split_crc(frame) {
        Some((body, received)) => {
            let computed = crc16(body);
            if computed == received {
                Ok(())
            } else {
                Err((computed, received))
            }
        },
        None => Err((crc16(&[]), 0)),
    }
}

/// Append the little-endian CRC of `frame` to itself
pub fn append(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_known_request() {
        // 01 03 00 00 00 01 -> CRC 0x0A84, sent as 84 0A
        let data = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(crc16(&data), 0x0A84);
    }

    #[test]
    fn test_crc16_check_value() {
        // CRC-16/MODBUS catalogue check value
        assert_eq!(crc16(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_crc16_empty_data() {
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_append_then_verify() {
        let mut frame = vec![0x01, 0x03, 0x02, 0x00, 0x2A];
        append(&mut frame);
        assert_eq!(frame.len(), 7);
        assert!(verify(&frame).is_ok());

        frame[3] ^= 0x01;
        assert!(verify(&frame).is_err());
    }

    #[test]
    fn test_split_crc_short_frame() {
        assert!(split_crc(&[0x01]).is_none());
        let (body, crc) = split_crc(&[0xAA, 0x34, 0x12]).expect("three bytes hold a crc");
        assert_eq!(body, &[0xAA]);
        assert_eq!(crc, 0x1234);
    }
}
