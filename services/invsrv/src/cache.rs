//! Latest known device state
//!
//! Readers get an `Arc<Snapshot>`: an immutable map that never shows a
//! half-applied poll cycle. Writers swap in a new map under a short write
//! lock; the lock is never held across a bus exchange.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::register_map::RegisterMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheEntry {
    /// Scaled value
    pub value: f64,
    pub raw: i64,
    /// When the value was last confirmed by the device; `None` until then
    pub last_updated: Option<DateTime<Utc>>,
    pub valid: bool,
}

impl CacheEntry {
    /// Placeholder for a value that has never been read
    pub const fn unknown() -> Self {
        Self {
            value: 0.0,
            raw: 0,
            last_updated: None,
            valid: false,
        }
    }

    pub fn fresh(value: f64, raw: i64, at: DateTime<Utc>) -> Self {
        Self {
            value,
            raw,
            last_updated: Some(at),
            valid: true,
        }
    }

    /// Seconds since the last confirmation
    pub fn age_seconds(&self, now: DateTime<Utc>) -> Option<f64> {
        self.last_updated
            .map(|t| (now - t).num_milliseconds().max(0) as f64 / 1000.0)
    }
}

/// Active codes of one fault bitset
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultEntry {
    pub codes: Vec<u16>,
    pub last_updated: Option<DateTime<Utc>>,
    pub valid: bool,
}

impl FaultEntry {
    pub const fn unknown() -> Self {
        Self {
            codes: Vec::new(),
            last_updated: None,
            valid: false,
        }
    }

    pub fn fresh(codes: Vec<u16>, at: DateTime<Utc>) -> Self {
        Self {
            codes,
            last_updated: Some(at),
            valid: true,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("no cached value named {0}")]
    NotFound(String),
}

/// Consistent view of every cached value
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Number of committed poll cycles
    pub cycle: u64,
    entries: HashMap<String, CacheEntry>,
    faults: HashMap<String, FaultEntry>,
}

impl Snapshot {
    pub fn get(&self, name: &str) -> Option<&CacheEntry> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CacheEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn fault(&self, name: &str) -> Option<&FaultEntry> {
        self.faults.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
pub struct Cache {
    current: RwLock<Arc<Snapshot>>,
}

impl Cache {
    /// One `unknown` entry per name; the name set is fixed from here on
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries = names
            .into_iter()
            .map(|n| (n.into(), CacheEntry::unknown()))
            .collect();
        Self {
            current: RwLock::new(Arc::new(Snapshot {
                cycle: 0,
                entries,
                faults: HashMap::new(),
            })),
        }
    }

    /// Entries for every value and fault bitset in `map`
    pub fn for_map(map: &RegisterMap) -> Self {
        Self::new(map.value_names()).with_faults(map.faults().iter().map(|f| f.name.clone()))
    }

    /// Add one `unknown` fault entry per bitset name
    pub fn with_faults<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let snapshot = Arc::make_mut(self.current.get_mut());
        snapshot
            .faults
            .extend(names.into_iter().map(|n| (n.into(), FaultEntry::unknown())));
        self
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read())
    }

    pub fn get(&self, name: &str) -> Result<CacheEntry, CacheError> {
        self.current
            .read()
            .get(name)
            .copied()
            .ok_or_else(|| CacheError::NotFound(name.to_string()))
    }

    /// Commit one poll cycle of values atomically and return its cycle number.
    ///
    /// Names absent from `updates` keep their previous entry, and so do
    /// entries confirmed later than the staged value (a write that landed
    /// while the cycle was still reading).
    pub fn replace(&self, updates: HashMap<String, CacheEntry>) -> u64 {
        self.commit(updates, HashMap::new())
    }

    /// Like [`Cache::replace`], with fault bitsets swapped in alongside
    pub fn commit(
        &self,
        updates: HashMap<String, CacheEntry>,
        faults: HashMap<String, FaultEntry>,
    ) -> u64 {
        let mut guard = self.current.write();
        // Clones only if a reader still holds the previous snapshot
        let next = Arc::make_mut(&mut guard);
        for (name, entry) in updates {
            match next.entries.get_mut(&name) {
                Some(slot) if is_older(&entry, &*slot) => {
                    debug!("Keeping {} confirmed after this cycle read it", name);
                },
                Some(slot) => *slot = entry,
                None => debug!("Ignoring update for unknown value {}", name),
            }
        }
        for (name, entry) in faults {
            match next.faults.get_mut(&name) {
                Some(slot) => *slot = entry,
                None => debug!("Ignoring update for unknown fault block {}", name),
            }
        }
        next.cycle += 1;
        next.cycle
    }

    /// Update a single entry outside the poll cycle
    pub fn set(&self, name: &str, entry: CacheEntry) -> Result<(), CacheError> {
        let mut guard = self.current.write();
        if !guard.entries.contains_key(name) {
            return Err(CacheError::NotFound(name.to_string()));
        }
        let next = Arc::make_mut(&mut guard);
        if let Some(slot) = next.entries.get_mut(name) {
            *slot = entry;
        }
        Ok(())
    }
}

fn is_older(staged: &CacheEntry, current: &CacheEntry) -> bool {
    match (staged.last_updated, current.last_updated) {
        (Some(staged), Some(current)) => staged < current,
        (None, Some(_)) => true,
        _ => false,
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::thread;

    const NAMES: [&str; 6] = [
        "battery_soc",
        "battery_power",
        "grid_power",
        "load_power",
        "pv1_power",
        "pv2_power",
    ];

    #[test]
    fn test_new_entries_start_invalid() {
        let cache = Cache::new(NAMES);
        let entry = cache.get("battery_soc").unwrap();
        assert!(!entry.valid);
        assert_eq!(entry.last_updated, None);
        assert_eq!(cache.snapshot().cycle, 0);
        assert_eq!(
            cache.get("missing"),
            Err(CacheError::NotFound("missing".into()))
        );
    }

    #[test]
    fn test_replace_keeps_untouched_entries() {
        let cache = Cache::new(NAMES);
        let now = Utc::now();
        let first: HashMap<_, _> = NAMES
            .iter()
            .map(|n| (n.to_string(), CacheEntry::fresh(1.0, 1, now)))
            .collect();
        assert_eq!(cache.replace(first), 1);

        let later = now + chrono::Duration::seconds(5);
        let second = HashMap::from([("grid_power".to_string(), CacheEntry::fresh(2.0, 2, later))]);
        assert_eq!(cache.replace(second), 2);

        assert_eq!(cache.get("grid_power").unwrap().value, 2.0);
        let kept = cache.get("battery_soc").unwrap();
        assert_eq!(kept.value, 1.0);
        assert_eq!(kept.last_updated, Some(now));
    }

    #[test]
    fn test_set_rejects_unknown_names() {
        let cache = Cache::new(NAMES);
        let entry = CacheEntry::fresh(20.0, 20, Utc::now());
        assert!(cache.set("grid_power", entry).is_ok());
        assert!(cache.set("nope", entry).is_err());
        assert_eq!(cache.snapshot().cycle, 0);
    }

    #[test]
    fn test_replace_keeps_entries_confirmed_after_the_read() {
        let cache = Cache::new(NAMES);
        let read_at = Utc::now();
        let written_at = read_at + chrono::Duration::milliseconds(300);
        cache.set("grid_power", CacheEntry::fresh(20.0, 20, written_at)).unwrap();

        let cycle = cache.replace(HashMap::from([
            ("grid_power".to_string(), CacheEntry::fresh(5000.0, 5000, read_at)),
            ("pv1_power".to_string(), CacheEntry::fresh(900.0, 900, read_at)),
        ]));

        assert_eq!(cycle, 1);
        let kept = cache.get("grid_power").unwrap();
        assert_eq!(kept.value, 20.0);
        assert_eq!(kept.last_updated, Some(written_at));
        assert_eq!(cache.get("pv1_power").unwrap().value, 900.0);

        // A later read of the same register wins again
        let reread_at = written_at + chrono::Duration::seconds(10);
        cache.replace(HashMap::from([(
            "grid_power".to_string(),
            CacheEntry::fresh(20.0, 20, reread_at),
        )]));
        assert_eq!(cache.get("grid_power").unwrap().last_updated, Some(reread_at));
    }

    #[test]
    fn test_faults_commit_with_values() {
        let cache = Cache::new(NAMES).with_faults(["fault_codes"]);
        assert!(!cache.snapshot().fault("fault_codes").unwrap().valid);

        let now = Utc::now();
        let cycle = cache.commit(
            HashMap::from([("battery_soc".to_string(), CacheEntry::fresh(80.0, 80, now))]),
            HashMap::from([
                ("fault_codes".to_string(), FaultEntry::fresh(vec![1, 8, 32], now)),
                ("unknown".to_string(), FaultEntry::fresh(vec![2], now)),
            ]),
        );

        let snap = cache.snapshot();
        assert_eq!(cycle, 1);
        assert_eq!(snap.fault("fault_codes").unwrap().codes, vec![1, 8, 32]);
        assert!(snap.fault("unknown").is_none());
        assert_eq!(snap.get("battery_soc").unwrap().value, 80.0);

        // A values-only commit leaves the faults alone
        cache.replace(HashMap::new());
        assert_eq!(cache.snapshot().fault("fault_codes").unwrap().codes, vec![1, 8, 32]);
    }

    #[test]
    fn test_held_snapshot_is_unaffected_by_later_commits() {
        let cache = Cache::new(NAMES);
        let before = cache.snapshot();
        cache.replace(HashMap::from([(
            "pv1_power".to_string(),
            CacheEntry::fresh(900.0, 900, Utc::now()),
        )]));
        assert!(!before.get("pv1_power").unwrap().valid);
        assert!(cache.snapshot().get("pv1_power").unwrap().valid);
    }

    #[test]
    fn test_snapshots_never_mix_cycles() {
        let cache = Arc::new(Cache::new(NAMES));
        let cycles = 2_000u64;

        let writer = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 1..=cycles {
                    // Every value in cycle i carries the tag i
                    let updates = NAMES
                        .iter()
                        .map(|n| {
                            (
                                n.to_string(),
                                CacheEntry::fresh(i as f64, i as i64, Utc::now()),
                            )
                        })
                        .collect();
                    cache.replace(updates);
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || loop {
                    let snap = cache.snapshot();
                    let tags: Vec<i64> = NAMES.iter().map(|n| snap.get(n).unwrap().raw).collect();
                    assert!(
                        tags.iter().all(|t| *t == tags[0]),
                        "mixed cycles in one snapshot: {tags:?}"
                    );
                    assert_eq!(tags[0] as u64, snap.cycle);
                    if snap.cycle == cycles {
                        break;
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }
}
