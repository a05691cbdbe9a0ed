//! Concurrent priming phase.
//!
//! Each chain slot gets its own lock. The lock is taken on the caller's
//! task before the worker is spawned and released by the worker once
//! `prepare` returns, so the apply loop waiting on slot `i` can neither
//! overtake nor run alongside filter `i`'s `prepare`. Slots are
//! independent: waiting on one never waits on another.

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use super::ChainLink;
use crate::entity::Entity;
use crate::telemetry::counters;

/// Per-slot locks of one evaluation.
pub struct SlotLocks {
    slots: Vec<Arc<Mutex<()>>>,
}

impl SlotLocks {
    /// Wait until slot `index` finished priming and take it.
    ///
    /// `None` when the chain has no such slot.
    pub async fn acquire(&self, index: usize) -> Option<OwnedMutexGuard<()>> {
        let slot = self.slots.get(index)?.clone();
        Some(slot.lock_owned().await)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Start `prepare` for every link on its own task and return at once.
pub(crate) async fn prime(
    proxy: &Arc<str>,
    entity: &Arc<dyn Entity>,
    chain: &[ChainLink],
) -> SlotLocks {
    let mut slots = Vec::with_capacity(chain.len());

    for (index, link) in chain.iter().enumerate() {
        let slot = Arc::new(Mutex::new(()));
        // Uncontended: nobody else has seen this slot yet.
        let guard = slot.clone().lock_owned().await;
        slots.push(slot);

        let proxy = proxy.clone();
        let name = link.name.clone();
        let filter = link.filter.clone();
        let entity = entity.clone();

        tokio::spawn(async move {
            match filter.prepare(entity.as_ref()).await {
                Ok(()) => debug!(proxy = %proxy, filter = %name, index, "filter primed"),
                Err(e) => {
                    warn!(
                        proxy = %proxy,
                        ip = %entity.ip(),
                        filter = %name,
                        error = %e,
                        "filter prepare failed"
                    );
                    counters::filter_error(&proxy, &name, "prepare");
                }
            }

            drop(entity);
            drop(guard);
        });
    }

    SlotLocks { slots }
}
