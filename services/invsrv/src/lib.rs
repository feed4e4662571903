//! Inverter bridge service (`invsrv`)
//!
//! Polls a Modbus RTU inverter into an in-memory cache, serves the cache over
//! HTTP and Prometheus, and writes validated settings back to the device.
//!
//! ```text
//! Poller ──┐                       ┌── api (axum)
//!          ├── ModbusHandle ──▶ ModbusWorker ──▶ serial link
//! Gateway ─┘                       └── metrics
//!     │                                  ▲
//!     └──────────────▶ Cache ────────────┘
//! ```

pub mod api;
pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod derived;
pub mod gateway;
pub mod metrics;
pub mod poller;
pub mod register_map;

pub use cache::{Cache, CacheEntry, FaultEntry, Snapshot};
pub use config::AppConfig;
pub use gateway::{WriteError, WriteGateway};
pub use register_map::{RegisterDef, RegisterMap};
