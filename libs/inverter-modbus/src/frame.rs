//! RTU framing: unit id + PDU + CRC-16 (low byte first)

use crc::{Crc, CRC_16_MODBUS};

use crate::constants::{
    CRC_LEN, EXCEPTION_FLAG, EXCEPTION_FRAME_LEN, FC_READ_HOLDING_REGISTERS,
    FC_WRITE_SINGLE_REGISTER, READ_REPLY_HEADER_LEN, WRITE_SINGLE_FRAME_LEN,
};
use crate::error::CodecError;
use crate::pdu::ModbusPdu;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// Wrap a PDU into an RTU frame addressed to `unit_id`
pub fn build(unit_id: u8, pdu: &ModbusPdu) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + pdu.len() + CRC_LEN);
    frame.push(unit_id);
    frame.extend_from_slice(pdu.as_slice());
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Verify the CRC and split a frame into unit id and PDU
pub fn parse(frame: &[u8]) -> Result<(u8, ModbusPdu), CodecError> {
    // Shortest legal reply is an exception: unit + fc + code + crc
    if frame.len() < EXCEPTION_FRAME_LEN {
        return Err(CodecError::TooShort { len: frame.len() });
    }

    let body_len = frame.len() - CRC_LEN;
    let received = u16::from_le_bytes([frame[body_len], frame[body_len + 1]]);
    let expected = crc16(&frame[..body_len]);
    if received != expected {
        return Err(CodecError::ChecksumMismatch { expected, received });
    }

    let pdu = ModbusPdu::from_slice(&frame[1..body_len])?;
    Ok((frame[0], pdu))
}

/// Total length of the reply frame that starts with `buf`, once enough of it
/// has arrived to tell.
///
/// Unknown function codes complete immediately so the decoder can reject
/// them instead of waiting for the reply timeout.
pub fn expected_len(buf: &[u8]) -> Option<usize> {
    let fc = *buf.get(1)?;
    if fc & EXCEPTION_FLAG != 0 {
        return Some(EXCEPTION_FRAME_LEN);
    }
    match fc {
        FC_READ_HOLDING_REGISTERS => {
            let byte_count = *buf.get(2)? as usize;
            Some(READ_REPLY_HEADER_LEN + byte_count + CRC_LEN)
        },
        FC_WRITE_SINGLE_REGISTER => Some(WRITE_SINGLE_FRAME_LEN),
        _ => Some(buf.len()),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::pdu::PduBuilder;

    #[test]
    fn test_crc_known_request() {
        // 01 03 00 00 00 01 -> CRC 0x0A84, sent as 84 0A
        let pdu = PduBuilder::read_holding(0, 1).unwrap();
        let frame = build(1, &pdu);
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
    }

    #[test]
    fn test_parse_detects_corruption() {
        let pdu = PduBuilder::write_single(232, 1).unwrap();
        let mut frame = build(1, &pdu);
        let (unit, parsed) = parse(&frame).unwrap();
        assert_eq!(unit, 1);
        assert_eq!(parsed.as_slice(), pdu.as_slice());

        frame[3] ^= 0x01;
        assert!(matches!(
            parse(&frame),
            Err(CodecError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_parse_too_short() {
        assert_eq!(parse(&[0x01, 0x83]), Err(CodecError::TooShort { len: 2 }));
    }

    #[test]
    fn test_expected_len_rules() {
        assert_eq!(expected_len(&[0x01]), None);
        assert_eq!(expected_len(&[0x01, 0x03]), None);
        assert_eq!(expected_len(&[0x01, 0x03, 0x04]), Some(9));
        assert_eq!(expected_len(&[0x01, 0x06]), Some(8));
        assert_eq!(expected_len(&[0x01, 0x83]), Some(5));
        assert_eq!(expected_len(&[0x01, 0x2B, 0x00]), Some(3));
    }
}
