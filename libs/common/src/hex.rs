//! Hex formatting for raw frame tracing

use std::fmt::Write;

/// Format bytes as space-separated uppercase hex pairs
///
/// Example: `[0x01, 0x03, 0xAB]` -> `"01 03 AB"`
pub fn frame_hex(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            result.push(' ');
        }
        // Writing into a String cannot fail
        let _ = write!(&mut result, "{:02X}", byte);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_hex_read_request() {
        assert_eq!(
            frame_hex(&[0x01, 0x03, 0x00, 0x6C, 0x00, 0x02]),
            "01 03 00 6C 00 02"
        );
    }

    #[test]
    fn test_frame_hex_empty_and_single() {
        assert_eq!(frame_hex(&[]), "");
        assert_eq!(frame_hex(&[0x0F]), "0F");
    }
}
