//! Error types for one exchange and for the client boundary

use std::fmt;
use thiserror::Error;

use crate::transport::TransportError;

/// Modbus exception code returned by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExceptionCode(pub u8);

impl ExceptionCode {
    pub fn description(&self) -> &'static str {
        match self.0 {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Slave Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Slave Device Busy",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X} ({})", self.0, self.description())
    }
}

/// Reply frame could not be turned into a response
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{received:04X}")]
    ChecksumMismatch { expected: u16, received: u16 },

    #[error("device exception on FC{function:02X}: {code}")]
    Exception { function: u8, code: ExceptionCode },

    #[error("malformed reply: {0}")]
    Malformed(String),

    #[error("reply too short: {len} bytes")]
    TooShort { len: usize },
}

/// Whether an exchange failure is worth another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    Retryable,
    Terminal,
}

/// Failure of a single request/reply exchange
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl AttemptError {
    /// Timeouts and line noise are retried. A device exception or a dead
    /// port is not: the device answered, or nothing will answer.
    pub fn retryability(&self) -> Retryability {
        match self {
            Self::Transport(TransportError::Timeout(_)) => Retryability::Retryable,
            Self::Transport(_) => Retryability::Terminal,
            Self::Codec(CodecError::Exception { .. }) => Retryability::Terminal,
            Self::Codec(_) => Retryability::Retryable,
        }
    }
}

/// Outcome of a request at the client boundary
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    #[error("device unreachable after {attempts} attempts: {last}")]
    Unreachable { attempts: u32, last: AttemptError },

    #[error("device rejected request: {0}")]
    Rejected(ExceptionCode),

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
}
