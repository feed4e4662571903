//! Modbus RTU protocol constants

/// Read Holding Registers
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Write Single Register
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Bit set on the function code of an exception reply
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Maximum PDU size (Modbus application protocol)
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum RTU frame: unit id + PDU + CRC
pub const MAX_RTU_FRAME_SIZE: usize = 1 + MAX_PDU_SIZE + 2;

/// Maximum registers per FC 0x03 request
pub const MAX_READ_REGISTERS: u16 = 125;

/// Unit id + FC + exception code + CRC
pub const EXCEPTION_FRAME_LEN: usize = 5;

/// Unit id + FC + address + value + CRC
pub const WRITE_SINGLE_FRAME_LEN: usize = 8;

/// Unit id + FC + byte count, before the register payload
pub const READ_REPLY_HEADER_LEN: usize = 3;

pub const CRC_LEN: usize = 2;
