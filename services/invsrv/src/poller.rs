//! Timer-driven poll cycle
//!
//! Each cycle reads the register map in contiguous blocks, decodes what came
//! back and commits it to the cache in one swap. A failed block leaves its
//! registers untouched and the cycle carries on. A cycle cut short by
//! shutdown commits nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use inverter_modbus::{constants::MAX_READ_REGISTERS, ClientError, ModbusHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{Cache, CacheEntry, FaultEntry};
use crate::register_map::{decode_faults, RegisterMap};

/// One FC 0x03 request covering one or more registers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBlock {
    pub start: u16,
    pub count: u16,
    /// Indices into `RegisterMap::registers()`
    pub members: Vec<usize>,
    /// Indices into `RegisterMap::faults()`
    pub faults: Vec<usize>,
}

enum Member {
    Register(usize),
    Faults(usize),
}

impl ReadBlock {
    fn new(start: u16, last: u16) -> Self {
        Self {
            start,
            count: last - start + 1,
            members: Vec::new(),
            faults: Vec::new(),
        }
    }

    fn add(&mut self, member: Member) {
        match member {
            Member::Register(idx) => self.members.push(idx),
            Member::Faults(idx) => self.faults.push(idx),
        }
    }
}

/// Group registers and fault bitsets into read blocks in ascending address
/// order.
///
/// A block grows while the hole before the next value is at most `max_gap`
/// addresses and the block stays within `max_block` registers. A value wider
/// than `max_block` still gets a block of its own.
pub fn plan_blocks(map: &RegisterMap, max_block: u16, max_gap: u16) -> Vec<ReadBlock> {
    let max_block = max_block.clamp(2, MAX_READ_REGISTERS);

    let mut spans: Vec<(u16, u16, Member)> = map
        .registers()
        .iter()
        .enumerate()
        .map(|(idx, reg)| (reg.address, reg.last_address(), Member::Register(idx)))
        .chain(
            map.faults()
                .iter()
                .enumerate()
                .map(|(idx, f)| (f.address, f.last_address(), Member::Faults(idx))),
        )
        .collect();
    spans.sort_by_key(|s| s.0);

    let mut blocks: Vec<ReadBlock> = Vec::new();
    for (address, last, member) in spans {
        if let Some(block) = blocks.last_mut() {
            let block_end = block.start + block.count - 1;
            let gap = address - block_end - 1;
            let span = last - block.start + 1;
            if gap <= max_gap && span <= max_block {
                block.count = span;
                block.add(member);
                continue;
            }
        }
        let mut block = ReadBlock::new(address, last);
        block.add(member);
        blocks.push(block);
    }
    blocks
}

/// Summary of one poll cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u64,
    pub blocks_ok: usize,
    pub blocks_failed: usize,
    pub values_committed: usize,
    pub elapsed: Duration,
}

/// Receives poll failures and cycle summaries
pub trait PollObserver: Send + Sync {
    fn block_failed(&self, block: &ReadBlock, error: &ClientError);

    fn cycle_completed(&self, _report: &CycleReport) {}
}

/// Default observer: log through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl PollObserver for TracingObserver {
    fn block_failed(&self, block: &ReadBlock, error: &ClientError) {
        warn!(
            "Read of {} registers at {} failed: {}",
            block.count, block.start, error
        );
    }

    fn cycle_completed(&self, report: &CycleReport) {
        debug!(
            "Poll cycle {}: {} blocks ok, {} failed, {} values in {:?}",
            report.cycle,
            report.blocks_ok,
            report.blocks_failed,
            report.values_committed,
            report.elapsed
        );
    }
}

pub struct Poller {
    map: Arc<RegisterMap>,
    cache: Arc<Cache>,
    modbus: ModbusHandle,
    blocks: Vec<ReadBlock>,
    interval: Duration,
    observer: Arc<dyn PollObserver>,
}

impl Poller {
    pub fn new(
        map: Arc<RegisterMap>,
        cache: Arc<Cache>,
        modbus: ModbusHandle,
        interval: Duration,
        max_block: u16,
        max_gap: u16,
    ) -> Self {
        let blocks = plan_blocks(&map, max_block, max_gap);
        Self {
            map,
            cache,
            modbus,
            blocks,
            interval,
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn PollObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn blocks(&self) -> &[ReadBlock] {
        &self.blocks
    }

    /// Run one full cycle and commit it
    pub async fn poll_once(&self) -> CycleReport {
        let started = Instant::now();
        let mut staged: HashMap<String, CacheEntry> = HashMap::new();
        let mut faults: HashMap<String, FaultEntry> = HashMap::new();
        let mut blocks_ok = 0;
        let mut blocks_failed = 0;

        for block in &self.blocks {
            let words = match self.modbus.read_holding(block.start, block.count).await {
                Ok(words) => words,
                Err(e) => {
                    blocks_failed += 1;
                    self.observer.block_failed(block, &e);
                    continue;
                },
            };
            blocks_ok += 1;

            let now = Utc::now();
            for &idx in &block.members {
                let reg = &self.map.registers()[idx];
                let offset = usize::from(reg.address - block.start);
                let decoded = words.get(offset..).and_then(|w| reg.decode(w));
                match decoded {
                    Some((raw, value)) => {
                        staged.insert(reg.name.clone(), CacheEntry::fresh(value, raw, now));
                    },
                    None => warn!("Short read for {} at {}", reg.name, reg.address),
                }
            }
            for &idx in &block.faults {
                let def = &self.map.faults()[idx];
                let offset = usize::from(def.address - block.start);
                match words.get(offset..offset + usize::from(def.words)) {
                    Some(bits) => {
                        faults.insert(def.name.clone(), FaultEntry::fresh(decode_faults(bits), now));
                    },
                    None => warn!("Short read for {} at {}", def.name, def.address),
                }
            }
        }

        let now = Utc::now();
        for derived in self.map.derived() {
            let value = derived.evaluate(|name| staged.get(name).map(|e| e.value));
            if let Some(value) = value {
                staged.insert(
                    derived.name.clone(),
                    CacheEntry::fresh(value, value.round() as i64, now),
                );
            }
        }

        let values_committed = staged.len() + faults.len();
        let cycle = self.cache.commit(staged, faults);
        let report = CycleReport {
            cycle,
            blocks_ok,
            blocks_failed,
            values_committed,
            elapsed: started.elapsed(),
        };
        self.observer.cycle_completed(&report);
        report
    }

    /// Poll every interval until cancelled or the bus worker is gone.
    ///
    /// Cancellation abandons a cycle in progress without committing it.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "Poller started: {} registers in {} blocks every {:?}",
            self.map.len(),
            self.blocks.len(),
            self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {},
            }
            if self.modbus.is_closed() {
                warn!("Modbus worker has stopped, poller exiting");
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Poll cycle abandoned on shutdown");
                    break;
                },
                _ = self.poll_once() => {},
            }
        }
        info!("Poller stopped");
    }
}
