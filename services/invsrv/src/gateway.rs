//! Validated setting writes
//!
//! A write goes through the same bus worker as the poller, so it queues
//! behind any block read already in flight. The cache only changes once the
//! device has echoed the new value back.

use std::sync::Arc;

use chrono::Utc;
use inverter_modbus::{ClientError, ModbusHandle};
use thiserror::Error;
use tracing::{info, warn};

use crate::cache::{Cache, CacheEntry};
use crate::register_map::{EncodeError, RegisterMap};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum WriteError {
    #[error("unknown register: {0}")]
    UnknownRegister(String),

    #[error("register {0} is read-only")]
    NotWritable(String),

    #[error("value rejected for {name}: {reason}")]
    OutOfRange { name: String, reason: EncodeError },

    #[error(transparent)]
    Client(#[from] ClientError),
}

#[derive(Clone)]
pub struct WriteGateway {
    map: Arc<RegisterMap>,
    cache: Arc<Cache>,
    modbus: ModbusHandle,
}

impl WriteGateway {
    pub fn new(map: Arc<RegisterMap>, cache: Arc<Cache>, modbus: ModbusHandle) -> Self {
        Self { map, cache, modbus }
    }

    /// True once the bus worker has stopped
    pub fn bus_closed(&self) -> bool {
        self.modbus.is_closed()
    }

    /// Write `requested` to the named setting and return the confirmed entry
    pub async fn write(&self, name: &str, requested: f64) -> Result<CacheEntry, WriteError> {
        let reg = self
            .map
            .get(name)
            .ok_or_else(|| WriteError::UnknownRegister(name.to_string()))?;

        let (raw, word) = reg.encode(requested).map_err(|reason| match reason {
            EncodeError::ReadOnly => WriteError::NotWritable(name.to_string()),
            reason => WriteError::OutOfRange {
                name: name.to_string(),
                reason,
            },
        })?;

        if let Err(e) = self.modbus.write_single(reg.address, word).await {
            warn!("Write of {} = {} failed: {}", name, requested, e);
            return Err(e.into());
        }

        let entry = CacheEntry::fresh(requested, raw, Utc::now());
        // Registered at construction, so this only fails if the map and cache disagree
        if let Err(e) = self.cache.set(name, entry) {
            warn!("Confirmed write not cached: {}", e);
        }
        info!("Wrote {} = {} (raw {})", name, requested, raw);
        Ok(entry)
    }
}

impl std::fmt::Debug for WriteGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteGateway")
            .field("registers", &self.map.len())
            .field("unit_id", &self.modbus.unit_id())
            .finish()
    }
}
