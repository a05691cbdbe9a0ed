//! In-memory verdict store.
//!
//! Volatile storage for development and testing. All data is lost on restart.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tracing::debug;

use super::{Counter, StoreError, Verdict, VerdictStore};

struct Entry {
    verdict: Verdict,
    updated: Instant,
}

/// In-memory verdict store.
///
/// Increments happen under the write lock, so concurrent evaluations for
/// the same identity never lose an update.
#[derive(Default)]
pub struct MemoryVerdictStore {
    records: RwLock<HashMap<String, Entry>>,
}

impl MemoryVerdictStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn increment(&self, ip: &str, counter: Counter) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        let entry = records.entry(ip.to_string()).or_insert_with(|| Entry {
            verdict: Verdict::default(),
            updated: Instant::now(),
        });
        counter.apply(&mut entry.verdict);
        entry.updated = Instant::now();
        Ok(())
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Backend("verdict map lock poisoned".to_string())
}

impl VerdictStore for MemoryVerdictStore {
    fn get_verdict(&self, ip: &str) -> Result<Verdict, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.get(ip).map(|e| e.verdict).unwrap_or_default())
    }

    fn inc_accepts(&self, ip: &str) -> Result<(), StoreError> {
        self.increment(ip, Counter::Accepts)
    }

    fn inc_rejects(&self, ip: &str) -> Result<(), StoreError> {
        self.increment(ip, Counter::Rejects)
    }

    fn prune(&self, max_age: Duration) -> Result<u64, StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        let before = records.len();
        records.retain(|_, e| e.updated.elapsed() <= max_age);
        let pruned = (before - records.len()) as u64;

        if pruned > 0 {
            debug!(pruned, "pruned stale verdicts");
        }
        Ok(pruned)
    }

    fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
