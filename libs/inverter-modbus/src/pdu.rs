//! Modbus PDU buffer and builder
//!
//! Fixed-size stack buffer; a PDU never exceeds 253 bytes.

use crate::constants::{
    EXCEPTION_FLAG, FC_READ_HOLDING_REGISTERS, FC_WRITE_SINGLE_REGISTER, MAX_PDU_SIZE,
    MAX_READ_REGISTERS,
};
use crate::error::CodecError;

#[derive(Debug, Clone, PartialEq)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Copy a PDU out of a received frame
    pub fn from_slice(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() > MAX_PDU_SIZE {
            return Err(CodecError::Malformed(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }
        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();
        Ok(pdu)
    }

    #[inline]
    pub fn push(&mut self, byte: u8) -> Result<(), CodecError> {
        if self.len >= MAX_PDU_SIZE {
            return Err(CodecError::Malformed("PDU buffer full".to_string()));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push a big-endian word
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> Result<(), CodecError> {
        for b in value.to_be_bytes() {
            self.push(b)?;
        }
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        self.as_slice().first().copied()
    }

    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .is_some_and(|fc| fc & EXCEPTION_FLAG != 0)
    }

    /// Read a big-endian word at `offset`
    pub fn u16_at(&self, offset: usize) -> Option<u16> {
        let bytes = self.as_slice().get(offset..offset + 2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds request PDUs for the two supported function codes
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl Default for PduBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PduBuilder {
    pub fn new() -> Self {
        Self {
            pdu: ModbusPdu::new(),
        }
    }

    pub fn function_code(mut self, fc: u8) -> Result<Self, CodecError> {
        self.pdu.push(fc)?;
        Ok(self)
    }

    pub fn word(mut self, value: u16) -> Result<Self, CodecError> {
        self.pdu.push_u16(value)?;
        Ok(self)
    }

    pub fn build(self) -> ModbusPdu {
        self.pdu
    }

    /// FC 0x03 request: start address + quantity
    pub fn read_holding(start: u16, count: u16) -> Result<ModbusPdu, CodecError> {
        if count == 0 || count > MAX_READ_REGISTERS {
            return Err(CodecError::Malformed(format!(
                "register count {} outside 1..={}",
                count, MAX_READ_REGISTERS
            )));
        }
        Ok(Self::new()
            .function_code(FC_READ_HOLDING_REGISTERS)?
            .word(start)?
            .word(count)?
            .build())
    }

    /// FC 0x06 request: address + value
    pub fn write_single(address: u16, value: u16) -> Result<ModbusPdu, CodecError> {
        Ok(Self::new()
            .function_code(FC_WRITE_SINGLE_REGISTER)?
            .word(address)?
            .word(value)?
            .build())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_read_holding_layout() {
        let pdu = PduBuilder::read_holding(0x00B8, 2).unwrap();
        assert_eq!(pdu.as_slice(), &[0x03, 0x00, 0xB8, 0x00, 0x02]);
        assert_eq!(pdu.u16_at(1), Some(0x00B8));
    }

    #[test]
    fn test_read_holding_rejects_bad_count() {
        assert!(PduBuilder::read_holding(0, 0).is_err());
        assert!(PduBuilder::read_holding(0, MAX_READ_REGISTERS + 1).is_err());
        assert!(PduBuilder::read_holding(0, MAX_READ_REGISTERS).is_ok());
    }

    #[test]
    fn test_write_single_layout() {
        let pdu = PduBuilder::write_single(245, 0x1388).unwrap();
        assert_eq!(pdu.as_slice(), &[0x06, 0x00, 0xF5, 0x13, 0x88]);
        assert!(!pdu.is_exception());
    }

    #[test]
    fn test_exception_pdu() {
        let pdu = ModbusPdu::from_slice(&[0x83, 0x02]).unwrap();
        assert!(pdu.is_exception());
        assert_eq!(pdu.u16_at(1), None);
    }

    #[test]
    fn test_push_until_full() {
        let mut pdu = ModbusPdu::new();
        for i in 0..MAX_PDU_SIZE {
            pdu.push(i as u8).unwrap();
        }
        assert!(pdu.push(0xFF).is_err());
        assert!(ModbusPdu::from_slice(&[0u8; MAX_PDU_SIZE + 1]).is_err());
    }
}
