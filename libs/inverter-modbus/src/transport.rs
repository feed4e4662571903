//! Physical link to the inverter
//!
//! A transport moves one request frame out and one reply frame back. It knows
//! how long a reply is (via [`frame::expected_len`]) but nothing about what
//! the reply means.

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use crate::constants::MAX_RTU_FRAME_SIZE;
use crate::frame;

/// Transport layer error types
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    /// No complete frame arrived in time
    #[error("no complete reply within {0:?}")]
    Timeout(Duration),

    /// Hardware or OS level failure; the handle has been dropped
    #[error("IO error: {0}")]
    Io(String),

    /// The port could not be opened
    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Request/reply exchange over a half-duplex link.
///
/// Not reentrant: `&mut self` guarantees one exchange at a time.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Write `frame`, then read until one complete reply frame is in hand
    /// or `timeout` elapses.
    async fn send_and_receive(
        &mut self,
        frame: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Release the underlying handle
    async fn close(&mut self);

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Serial link parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        }
    }
}

impl SerialConfig {
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.port.is_empty() {
            return Err(TransportError::Config("port cannot be empty".to_string()));
        }
        if self.baud_rate == 0 {
            return Err(TransportError::Config(
                "baud rate must be greater than 0".to_string(),
            ));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(TransportError::Config(format!(
                "data bits must be 5-8, got {}",
                self.data_bits
            )));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(TransportError::Config(format!(
                "stop bits must be 1 or 2, got {}",
                self.stop_bits
            )));
        }
        Ok(())
    }

    fn tokio_parity(&self) -> tokio_serial::Parity {
        match self.parity {
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::None => tokio_serial::Parity::None,
        }
    }

    fn tokio_data_bits(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    fn tokio_stop_bits(&self) -> tokio_serial::StopBits {
        match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }
}

/// Serial port transport, opened on first use and after any I/O failure
pub struct SerialTransport {
    config: SerialConfig,
    port: Option<SerialStream>,
}

impl SerialTransport {
    pub fn new(config: SerialConfig) -> Result<Self, TransportError> {
        config.validate()?;
        Ok(Self { config, port: None })
    }

    fn ensure_open(&mut self) -> Result<&mut SerialStream, TransportError> {
        if self.port.is_none() {
            debug!("Opening serial port: {}", self.config.port);
            let port = tokio_serial::new(&self.config.port, self.config.baud_rate)
                .data_bits(self.config.tokio_data_bits())
                .parity(self.config.tokio_parity())
                .stop_bits(self.config.tokio_stop_bits())
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
                .map_err(|e| {
                    TransportError::NotConnected(format!("{}: {}", self.config.port, e))
                })?;

            #[cfg(unix)]
            let port = {
                let mut port = port;
                port.set_exclusive(false).map_err(|e| {
                    TransportError::Io(format!("Failed to set exclusive mode: {e}"))
                })?;
                port
            };

            info!(
                "Opened serial port {} @ {} baud",
                self.config.port, self.config.baud_rate
            );
            self.port = Some(port);
        }
        self.port
            .as_mut()
            .ok_or_else(|| TransportError::NotConnected(self.config.port.clone()))
    }
}

/// Write a frame and accumulate bytes until the framing rule says the reply
/// is complete.
async fn exchange(port: &mut SerialStream, request: &[u8]) -> std::io::Result<Vec<u8>> {
    port.write_all(request).await?;
    port.flush().await?;

    let mut buf = BytesMut::with_capacity(MAX_RTU_FRAME_SIZE);
    let mut chunk = [0u8; 64];
    loop {
        let n = port.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "serial port closed",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        match frame::expected_len(&buf) {
            Some(len) if buf.len() >= len => {
                buf.truncate(len);
                return Ok(buf.to_vec());
            },
            _ if buf.len() >= MAX_RTU_FRAME_SIZE => return Ok(buf.to_vec()),
            _ => {},
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn send_and_receive(
        &mut self,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let port = self.ensure_open()?;

        // Drop anything a previous, abandoned reply left behind
        if let Err(e) = port.clear(tokio_serial::ClearBuffer::Input) {
            debug!("Failed to clear serial input buffer: {}", e);
        }

        debug!(hex_data = %common::hex::frame_hex(request), direction = "send", "[Serial] Raw frame");

        match tokio::time::timeout(timeout, exchange(port, request)).await {
            Ok(Ok(reply)) => {
                debug!(hex_data = %common::hex::frame_hex(&reply), direction = "recv", "[Serial] Raw frame");
                Ok(reply)
            },
            Ok(Err(e)) => {
                warn!("Serial I/O failure on {}: {}", self.config.port, e);
                // Reopened on the next exchange
                self.port = None;
                Err(TransportError::Io(e.to_string()))
            },
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    async fn close(&mut self) {
        if self.port.take().is_some() {
            info!("Closed serial port: {}", self.config.port);
        }
    }

    fn name(&self) -> &str {
        &self.config.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_link_parameters() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.parity, Parity::None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_link_parameters() {
        let bad_bits = SerialConfig {
            data_bits: 9,
            ..Default::default()
        };
        assert!(matches!(bad_bits.validate(), Err(TransportError::Config(_))));

        let bad_stop = SerialConfig {
            stop_bits: 3,
            ..Default::default()
        };
        assert!(SerialTransport::new(bad_stop).is_err());
    }

    #[tokio::test]
    async fn test_missing_port_is_not_connected() {
        let mut transport = SerialTransport::new(SerialConfig {
            port: "/dev/does-not-exist-invsrv".to_string(),
            ..Default::default()
        })
        .unwrap_or_else(|e| panic!("config should be valid: {e}"));

        let result = transport
            .send_and_receive(&[0x01, 0x03], Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(TransportError::NotConnected(_))));
    }
}
