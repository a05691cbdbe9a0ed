//! Persistent verdict store using fjall (pure Rust LSM-tree).
//!
//! Verdicts survive restarts, so peers classified yesterday are still
//! fast-pathed today.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::{Deserialize, Serialize};

use super::{Counter, StoreError, Verdict, VerdictStore};

const KEY_PREFIX: &str = "verdict_";

/// Persistent verdict store backed by a fjall keyspace.
pub struct PersistentVerdictStore {
    keyspace: Keyspace,
    verdicts: PartitionHandle,
    /// Serializes read-modify-write increments.
    write_lock: Mutex<()>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedVerdict {
    accepts: u64,
    rejects: u64,
    updated_at_epoch_ms: u64,
}

impl PersistentVerdictStore {
    /// Open or create the store at the given path.
    pub fn open(path: &Path) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(path)?;

        let keyspace = Config::new(path).open()?;
        let verdicts = keyspace.open_partition("verdicts", PartitionCreateOptions::default())?;

        let store = Arc::new(Self {
            keyspace,
            verdicts,
            write_lock: Mutex::new(()),
        });

        tracing::info!(
            path = %path.display(),
            verdicts = store.len(),
            "persistent verdict store opened"
        );

        Ok(store)
    }

    fn key(ip: &str) -> String {
        format!("{}{}", KEY_PREFIX, ip)
    }

    fn now_epoch_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    fn load(&self, key: &str) -> Result<Option<PersistedVerdict>, StoreError> {
        let Some(value) = self
            .verdicts
            .get(key.as_bytes())
            .map_err(|e| StoreError::Backend(e.to_string()))?
        else {
            return Ok(None);
        };

        serde_json::from_slice(&value)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    fn increment(&self, ip: &str, counter: Counter) -> Result<(), StoreError> {
        let key = Self::key(ip);
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Backend("write lock poisoned".to_string()))?;

        let stored = match self.load(&key) {
            Ok(stored) => stored,
            Err(StoreError::Corrupt { key, reason }) => {
                tracing::warn!(key = %key, error = %reason, "resetting undecodable verdict");
                None
            }
            Err(e) => return Err(e),
        };
        let mut verdict = stored
            .map(|p| Verdict {
                accepts: p.accepts,
                rejects: p.rejects,
            })
            .unwrap_or_default();
        counter.apply(&mut verdict);

        let persisted = PersistedVerdict {
            accepts: verdict.accepts,
            rejects: verdict.rejects,
            updated_at_epoch_ms: Self::now_epoch_ms(),
        };
        let value =
            serde_json::to_vec(&persisted).map_err(|e| StoreError::Backend(e.to_string()))?;

        self.verdicts
            .insert(key.as_bytes(), &value)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

impl VerdictStore for PersistentVerdictStore {
    fn get_verdict(&self, ip: &str) -> Result<Verdict, StoreError> {
        Ok(self
            .load(&Self::key(ip))?
            .map(|p| Verdict {
                accepts: p.accepts,
                rejects: p.rejects,
            })
            .unwrap_or_default())
    }

    fn inc_accepts(&self, ip: &str) -> Result<(), StoreError> {
        self.increment(ip, Counter::Accepts)
    }

    fn inc_rejects(&self, ip: &str) -> Result<(), StoreError> {
        self.increment(ip, Counter::Rejects)
    }

    fn prune(&self, max_age: Duration) -> Result<u64, StoreError> {
        let cutoff = Self::now_epoch_ms().saturating_sub(max_age.as_millis() as u64);
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Backend("write lock poisoned".to_string()))?;

        let mut to_delete = Vec::new();
        for item in self.verdicts.iter() {
            let (key, value) = item.map_err(|e| StoreError::Backend(e.to_string()))?;
            match serde_json::from_slice::<PersistedVerdict>(&value) {
                Ok(p) if p.updated_at_epoch_ms < cutoff => to_delete.push(key.to_vec()),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        key = %String::from_utf8_lossy(&key),
                        error = %e,
                        "dropping undecodable verdict"
                    );
                    to_delete.push(key.to_vec());
                }
            }
        }

        let mut pruned = 0u64;
        for key in to_delete {
            if self.verdicts.remove(key).is_ok() {
                pruned += 1;
            }
        }

        if pruned > 0 {
            tracing::debug!(pruned, "pruned stale verdicts");
        }
        Ok(pruned)
    }

    fn len(&self) -> usize {
        self.verdicts.len().unwrap_or(0)
    }

    fn name(&self) -> &'static str {
        "fjall"
    }

    fn flush(&self) -> anyhow::Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (Arc<PersistentVerdictStore>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = PersistentVerdictStore::open(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_unknown_identity_is_zero() {
        let (store, _temp) = create_test_store();
        assert_eq!(store.get_verdict("192.0.2.10").unwrap(), Verdict::default());
    }

    #[test]
    fn test_increments() {
        let (store, _temp) = create_test_store();
        store.inc_accepts("192.0.2.10").unwrap();
        store.inc_rejects("192.0.2.10").unwrap();
        store.inc_rejects("192.0.2.10").unwrap();

        assert_eq!(
            store.get_verdict("192.0.2.10").unwrap(),
            Verdict { accepts: 1, rejects: 2 }
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_persistence_across_restarts() {
        let temp_dir = TempDir::new().unwrap();

        {
            let store = PersistentVerdictStore::open(temp_dir.path()).unwrap();
            store.inc_rejects("2001:db8::7").unwrap();
            store.inc_rejects("2001:db8::7").unwrap();
            store.flush().unwrap();
        }

        {
            let store = PersistentVerdictStore::open(temp_dir.path()).unwrap();
            assert_eq!(store.get_verdict("2001:db8::7").unwrap().rejects, 2);
        }
    }

    #[test]
    fn test_concurrent_increments() {
        let (store, _temp) = create_test_store();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        store.inc_accepts("198.51.100.3").unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.get_verdict("198.51.100.3").unwrap().accepts, 200);
    }

    #[test]
    fn test_prune() {
        let (store, _temp) = create_test_store();
        store.inc_accepts("192.0.2.10").unwrap();

        assert_eq!(store.prune(Duration::from_secs(3600)).unwrap(), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.prune(Duration::ZERO).unwrap(), 1);
        assert_eq!(store.get_verdict("192.0.2.10").unwrap(), Verdict::default());
    }

    #[test]
    fn test_corrupt_record() {
        let (store, _temp) = create_test_store();
        store.verdicts.insert("verdict_192.0.2.99", b"not json").unwrap();

        assert!(matches!(
            store.get_verdict("192.0.2.99"),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_increment_overwrites_corrupt_record() {
        let (store, _temp) = create_test_store();
        store.verdicts.insert("verdict_192.0.2.98", b"{\"accepts\":").unwrap();

        store.inc_rejects("192.0.2.98").unwrap();
        store.inc_rejects("192.0.2.98").unwrap();

        assert_eq!(
            store.get_verdict("192.0.2.98").unwrap(),
            Verdict { accepts: 0, rejects: 2 }
        );
    }
}
