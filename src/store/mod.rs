//! Verdict cache: accept/reject counters keyed by network identity.
//!
//! The filter engine consults the cache before running any filter and
//! bumps exactly one counter after a full evaluation. Records are created
//! lazily: an identity the store has never seen reads as a zero record.
//!
//! ```text
//!              ┌──────────────────────────────┐
//!              │        FilterEngine          │
//!              └──────┬───────────────┬───────┘
//!          get_verdict│               │inc_accepts / inc_rejects
//!                     ▼               ▼
//!              ┌──────────────────────────────┐
//!              │         VerdictStore         │
//!              └──────┬───────────────┬───────┘
//!                     ▼               ▼
//!              ┌────────────┐  ┌─────────────┐
//!              │   Memory   │  │    Fjall    │
//!              │   (dev)    │  │   (prod)    │
//!              └────────────┘  └─────────────┘
//! ```
//!
//! # Implementations
//!
//! - [`MemoryVerdictStore`]: volatile, for development and tests
//! - [`PersistentVerdictStore`]: fjall-backed, survives restarts

mod factory;
mod memory;
mod persistent;

pub use factory::create_store;
pub use memory::MemoryVerdictStore;
pub use persistent::PersistentVerdictStore;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Accept/reject history of one network identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    /// Times the identity passed the full filter chain.
    pub accepts: u64,
    /// Times the identity was filtered.
    pub rejects: u64,
}

/// Which counter to bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Counter {
    Accepts,
    Rejects,
}

impl Counter {
    pub(crate) fn apply(self, verdict: &mut Verdict) {
        match self {
            Counter::Accepts => verdict.accepts = verdict.accepts.saturating_add(1),
            Counter::Rejects => verdict.rejects = verdict.rejects.saturating_add(1),
        }
    }
}

/// Verdict store error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The storage backend failed.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// A stored record could not be decoded.
    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Storage contract the filter engine relies on.
///
/// Shared by every concurrent evaluation, so increments must be atomic
/// per identity.
pub trait VerdictStore: Send + Sync {
    /// Read the record for `ip`. Unknown identities yield a zero record.
    fn get_verdict(&self, ip: &str) -> Result<Verdict, StoreError>;

    /// Increment the accept counter for `ip`.
    fn inc_accepts(&self, ip: &str) -> Result<(), StoreError>;

    /// Increment the reject counter for `ip`.
    fn inc_rejects(&self, ip: &str) -> Result<(), StoreError>;

    /// Remove records not updated within `max_age`. Returns how many went.
    fn prune(&self, max_age: Duration) -> Result<u64, StoreError>;

    /// Number of identities on record.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backend name for logs and the admin API.
    fn name(&self) -> &'static str;

    /// Flush pending writes to disk (no-op for in-memory).
    fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Shared store handle.
pub type SharedVerdictStore = Arc<dyn VerdictStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_verdict_is_zero() {
        let v = Verdict::default();
        assert_eq!(v.accepts, 0);
        assert_eq!(v.rejects, 0);
    }

    #[test]
    fn test_counter_apply() {
        let mut v = Verdict::default();
        Counter::Accepts.apply(&mut v);
        Counter::Rejects.apply(&mut v);
        Counter::Rejects.apply(&mut v);
        assert_eq!(v, Verdict { accepts: 1, rejects: 2 });
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Corrupt {
            key: "verdict_10.0.0.1".to_string(),
            reason: "EOF".to_string(),
        };
        assert!(err.to_string().contains("verdict_10.0.0.1"));
    }
}
