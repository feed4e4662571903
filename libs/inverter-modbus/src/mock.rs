//! Mock transport for testing
//!
//! Replays scripted replies first, then falls back to a simulated device
//! holding an in-memory register bank. Handles stay usable after the
//! transport has moved into a worker.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::constants::{EXCEPTION_FLAG, FC_READ_HOLDING_REGISTERS, FC_WRITE_SINGLE_REGISTER};
use crate::frame;
use crate::pdu::ModbusPdu;
use crate::transport::{Transport, TransportError};

/// What the mock does with the next request
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Return these bytes as the reply
    Frame(Vec<u8>),
    /// Stay silent for the whole reply timeout
    Timeout,
    /// Fail as if the port broke
    Io(String),
}

/// In-memory holding register bank answering FC 0x03 / 0x06
#[derive(Debug, Default)]
pub struct SimulatedDevice {
    pub unit_id: u8,
    pub registers: BTreeMap<u16, u16>,
    /// Reads touching these addresses time out
    pub silent: Vec<RangeInclusive<u16>>,
    /// Writes to these addresses get exception 0x02
    pub rejected_writes: HashSet<u16>,
}

impl SimulatedDevice {
    pub fn new(unit_id: u8) -> Self {
        Self {
            unit_id,
            ..Default::default()
        }
    }

    fn respond(&mut self, request: &[u8]) -> MockReply {
        let Ok((unit_id, pdu)) = frame::parse(request) else {
            return MockReply::Timeout;
        };
        if unit_id != self.unit_id {
            return MockReply::Timeout;
        }
        let (Some(fc), Some(address), Some(arg)) = (pdu.function_code(), pdu.u16_at(1), pdu.u16_at(3))
        else {
            return MockReply::Timeout;
        };

        match fc {
            FC_READ_HOLDING_REGISTERS => {
                let last = address.saturating_add(arg.saturating_sub(1));
                if self
                    .silent
                    .iter()
                    .any(|r| *r.start() <= last && address <= *r.end())
                {
                    return MockReply::Timeout;
                }
                let mut body = vec![fc, arg.saturating_mul(2) as u8];
                for a in address..=last {
                    let word = self.registers.get(&a).copied().unwrap_or(0);
                    body.extend_from_slice(&word.to_be_bytes());
                }
                MockReply::Frame(reply_frame(unit_id, &body))
            },
            FC_WRITE_SINGLE_REGISTER => {
                if self.rejected_writes.contains(&address) {
                    return MockReply::Frame(reply_frame(unit_id, &[fc | EXCEPTION_FLAG, 0x02]));
                }
                self.registers.insert(address, arg);
                MockReply::Frame(request.to_vec())
            },
            _ => MockReply::Frame(reply_frame(unit_id, &[fc | EXCEPTION_FLAG, 0x01])),
        }
    }
}

fn reply_frame(unit_id: u8, body: &[u8]) -> Vec<u8> {
    match ModbusPdu::from_slice(body) {
        Ok(pdu) => frame::build(unit_id, &pdu),
        Err(_) => Vec::new(),
    }
}

#[derive(Debug, Default)]
struct MockState {
    script: VecDeque<MockReply>,
    device: Option<SimulatedDevice>,
    sent: Vec<Vec<u8>>,
    close_count: usize,
}

/// Shared view into a [`MockTransport`]
#[derive(Debug, Clone, Default)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    /// Queue a reply ahead of the simulated device
    pub fn push(&self, reply: MockReply) {
        self.state.lock().script.push_back(reply);
    }

    /// Number of exchanges attempted so far
    pub fn attempts(&self) -> usize {
        self.state.lock().sent.len()
    }

    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.state.lock().sent.clone()
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().close_count
    }

    /// Mutate the simulated device, if one is attached
    pub fn with_device<R>(&self, f: impl FnOnce(&mut SimulatedDevice) -> R) -> Option<R> {
        self.state.lock().device.as_mut().map(f)
    }
}

/// Scriptable in-memory transport
#[derive(Debug, Default)]
pub struct MockTransport {
    handle: MockHandle,
}

impl MockTransport {
    /// Transport with no device: every unscripted request times out
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(device: SimulatedDevice) -> Self {
        let transport = Self::default();
        transport.handle.state.lock().device = Some(device);
        transport
    }

    pub fn handle(&self) -> MockHandle {
        self.handle.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_and_receive(
        &mut self,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let reply = {
            let mut state = self.handle.state.lock();
            state.sent.push(request.to_vec());
            match state.script.pop_front() {
                Some(reply) => reply,
                None => match state.device.as_mut() {
                    Some(device) => device.respond(request),
                    None => MockReply::Timeout,
                },
            }
        };

        debug!("mock transport reply: {:?}", reply);
        match reply {
            MockReply::Frame(bytes) => Ok(bytes),
            MockReply::Timeout => {
                tokio::time::sleep(timeout).await;
                Err(TransportError::Timeout(timeout))
            },
            MockReply::Io(msg) => Err(TransportError::Io(msg)),
        }
    }

    async fn close(&mut self) {
        self.handle.state.lock().close_count += 1;
    }

    fn name(&self) -> &str {
        "mock"
    }
}
