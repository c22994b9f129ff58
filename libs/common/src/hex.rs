//! Hex encoding utility
//! Used for TX/RX frame dumps and for logging discarded line noise

use std::fmt::Write;

/// Encode bytes as space separated uppercase pairs, the way frames are
/// usually shown on a bus monitor.
/// Example: [0x01, 0x03, 0x02] -> "01 03 02"
pub fn encode_spaced(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            result.push(' ');
        }
        // Writing to String buffer is infallible
        let _ = write!(&mut result, "{:02X}", byte);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_spaced_frame() {
        assert_eq!(
            encode_spaced(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]),
            "01 03 00 00 00 01 84 0A"
        );
    }

    #[test]
    fn test_encode_spaced_edges() {
        assert_eq!(encode_spaced(&[]), "");
        assert_eq!(encode_spaced(&[0x0F]), "0F");
        assert_eq!(encode_spaced(&[0xAB, 0xFF]), "AB FF");
    }
}
