//! Request encoding and reply decoding
//!
//! The codec deals in raw 16-bit words only. Scaling, signedness and names
//! belong to the register map one layer up.

use crate::constants::{
    EXCEPTION_FLAG, EXCEPTION_FRAME_LEN, FC_READ_HOLDING_REGISTERS, FC_WRITE_SINGLE_REGISTER,
};
use crate::error::{CodecError, ExceptionCode};
use crate::frame;
use crate::pdu::PduBuilder;

/// One exchange with the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    ReadHolding { unit_id: u8, start: u16, count: u16 },
    WriteSingle { unit_id: u8, address: u16, value: u16 },
}

impl Request {
    pub fn unit_id(&self) -> u8 {
        match *self {
            Self::ReadHolding { unit_id, .. } | Self::WriteSingle { unit_id, .. } => unit_id,
        }
    }

    pub fn function_code(&self) -> u8 {
        match self {
            Self::ReadHolding { .. } => FC_READ_HOLDING_REGISTERS,
            Self::WriteSingle { .. } => FC_WRITE_SINGLE_REGISTER,
        }
    }

    /// Encode into an RTU frame
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        match *self {
            Self::ReadHolding {
                unit_id,
                start,
                count,
            } => encode_read(unit_id, start, count),
            Self::WriteSingle {
                unit_id,
                address,
                value,
            } => encode_write(unit_id, address, value),
        }
    }
}

/// Decoded reply payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Registers(Vec<u16>),
    Written { address: u16, value: u16 },
}

pub fn encode_read(unit_id: u8, start: u16, count: u16) -> Result<Vec<u8>, CodecError> {
    let pdu = PduBuilder::read_holding(start, count)?;
    Ok(frame::build(unit_id, &pdu))
}

pub fn encode_write(unit_id: u8, address: u16, value: u16) -> Result<Vec<u8>, CodecError> {
    let pdu = PduBuilder::write_single(address, value)?;
    Ok(frame::build(unit_id, &pdu))
}

/// Decode `reply` against the request that produced it.
///
/// A reply from another unit, for another function, or with a payload that
/// does not match the request shape is `Malformed`.
pub fn decode(reply: &[u8], expected: &Request) -> Result<Response, CodecError> {
    let (unit_id, pdu) = frame::parse(reply)?;
    if unit_id != expected.unit_id() {
        return Err(CodecError::Malformed(format!(
            "reply from unit {}, expected {}",
            unit_id,
            expected.unit_id()
        )));
    }

    let fc = pdu.function_code().unwrap_or(0);
    let expected_fc = expected.function_code();

    if pdu.is_exception() {
        if fc & !EXCEPTION_FLAG != expected_fc || reply.len() != EXCEPTION_FRAME_LEN {
            return Err(CodecError::Malformed(format!(
                "exception frame FC{:02X} ({} bytes) does not answer FC{:02X}",
                fc,
                reply.len(),
                expected_fc
            )));
        }
        let code = pdu.as_slice().get(1).copied().unwrap_or(0);
        return Err(CodecError::Exception {
            function: expected_fc,
            code: ExceptionCode(code),
        });
    }

    if fc != expected_fc {
        return Err(CodecError::Malformed(format!(
            "function code {:02X}, expected {:02X}",
            fc, expected_fc
        )));
    }

    match *expected {
        Request::ReadHolding { count, .. } => {
            let data = pdu.as_slice();
            let byte_count = data.get(1).copied().unwrap_or(0) as usize;
            let payload = &data[2.min(data.len())..];
            if byte_count != usize::from(count) * 2 || payload.len() != byte_count {
                return Err(CodecError::Malformed(format!(
                    "byte count {} with {} payload bytes, expected {}",
                    byte_count,
                    payload.len(),
                    usize::from(count) * 2
                )));
            }
            let words = payload
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            Ok(Response::Registers(words))
        },
        Request::WriteSingle { address, value, .. } => {
            match (pdu.u16_at(1), pdu.u16_at(3)) {
                (Some(a), Some(v)) if a == address && v == value && pdu.len() == 5 => {
                    Ok(Response::Written { address, value })
                },
                (a, v) => Err(CodecError::Malformed(format!(
                    "write echo {:?}={:?}, expected {}={}",
                    a, v, address, value
                ))),
            }
        },
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::pdu::ModbusPdu;

    /// Frame a reply PDU the way a device would
    fn reply(unit_id: u8, pdu: &[u8]) -> Vec<u8> {
        frame::build(unit_id, &ModbusPdu::from_slice(pdu).unwrap())
    }

    fn read_reply(unit_id: u8, words: &[u16]) -> Vec<u8> {
        let mut pdu = vec![FC_READ_HOLDING_REGISTERS, (words.len() * 2) as u8];
        for w in words {
            pdu.extend_from_slice(&w.to_be_bytes());
        }
        reply(unit_id, &pdu)
    }

    #[test]
    fn test_read_reply_reproduces_requested_range() {
        let request = Request::ReadHolding {
            unit_id: 1,
            start: 183,
            count: 3,
        };
        let encoded = request.encode().unwrap();
        assert_eq!(&encoded[..6], &[0x01, 0x03, 0x00, 0xB7, 0x00, 0x03]);

        // Device answers with the values stored at 183..186
        let words = [0x1450, 0xFF9C, 0x0000];
        let decoded = decode(&read_reply(1, &words), &request).unwrap();
        assert_eq!(decoded, Response::Registers(words.to_vec()));
    }

    #[test]
    fn test_read_reply_wrong_count_is_malformed() {
        let request = Request::ReadHolding {
            unit_id: 1,
            start: 0,
            count: 2,
        };
        let err = decode(&read_reply(1, &[1]), &request).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn test_reply_from_other_unit_is_malformed() {
        let request = Request::ReadHolding {
            unit_id: 1,
            start: 0,
            count: 1,
        };
        let err = decode(&read_reply(2, &[7]), &request).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn test_exception_reply() {
        let request = Request::WriteSingle {
            unit_id: 1,
            address: 245,
            value: 20,
        };
        let err = decode(&reply(1, &[0x86, 0x03]), &request).unwrap_err();
        assert_eq!(
            err,
            CodecError::Exception {
                function: 0x06,
                code: ExceptionCode(0x03)
            }
        );
    }

    #[test]
    fn test_write_echo() {
        let request = Request::WriteSingle {
            unit_id: 1,
            address: 245,
            value: 20,
        };
        let encoded = request.encode().unwrap();
        // A correct device echoes the request frame verbatim
        assert_eq!(
            decode(&encoded, &request).unwrap(),
            Response::Written {
                address: 245,
                value: 20
            }
        );

        let wrong_value = encode_write(1, 245, 21).unwrap();
        assert!(matches!(
            decode(&wrong_value, &request),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_corrupted_reply_is_checksum_mismatch() {
        let request = Request::ReadHolding {
            unit_id: 1,
            start: 0,
            count: 1,
        };
        let mut frame = read_reply(1, &[0x1234]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            decode(&frame, &request),
            Err(CodecError::ChecksumMismatch { .. })
        ));
    }
}
