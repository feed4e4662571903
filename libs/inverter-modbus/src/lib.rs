//! Modbus RTU plumbing for the inverter bridge
//!
//! ```text
//! ModbusHandle ──(Request, oneshot)──▶ ModbusWorker
//!                                          └── Client (retry / backoff)
//!                                                ├── codec (PDU + RTU frame + CRC)
//!                                                └── Transport (serial link)
//! ```
//!
//! Only holding registers are supported: FC 0x03 reads and FC 0x06 single
//! register writes. Everything above this crate talks to the device through
//! a cloneable [`ModbusHandle`]; the worker task is the sole owner of the link.

pub mod client;
pub mod codec;
pub mod constants;
pub mod error;
pub mod frame;
pub mod pdu;
pub mod transport;
pub mod worker;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use client::{Client, RetryPolicy};
pub use codec::{Request, Response};
pub use error::{AttemptError, ClientError, CodecError, ExceptionCode, Retryability};
pub use transport::{Parity, SerialConfig, SerialTransport, Transport, TransportError};
pub use worker::{ModbusHandle, ModbusWorker, Outcome};
