//! Filter evaluation engine.
//!
//! One [`FilterEngine`] per proxy. For each inbound entity it:
//!
//! 1. reads the identity's verdict history and applies the
//!    [`ThresholdPolicy`], possibly skipping the chain entirely
//! 2. primes every filter concurrently (`prepare` on spawned tasks)
//! 3. applies filters in chain order, each one only after its own
//!    `prepare` finished, stopping at the first that filters
//! 4. bumps exactly one verdict counter
//!
//! Store and filter failures are logged and absorbed: they degrade
//! accuracy, never availability. The only observable result is the
//! [`Evaluation`].

mod prime;
mod threshold;

pub use prime::SlotLocks;
pub use threshold::{ThresholdDecision, ThresholdPolicy};

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::entity::Entity;
use crate::filter::{Filter, FilterOutcome, FilterSet};
use crate::store::{Counter, SharedVerdictStore, Verdict};
use crate::telemetry::counters;

/// Engine construction error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("can't find filter \"{filter}\" for proxy \"{proxy}\"")]
    UnknownFilter { proxy: String, filter: String },
}

/// Result of evaluating one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// Every filter passed.
    Accepted,
    /// Accepted on history alone; no filter ran.
    Allowlisted,
    /// Rejected on history alone; no filter ran.
    RejectedByThreshold,
    /// Filter `index` of the chain filtered the entity.
    Filtered { filter: String, index: usize },
}

impl Evaluation {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Evaluation::Accepted | Evaluation::Allowlisted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Evaluation::Accepted => "accepted",
            Evaluation::Allowlisted => "allowlisted",
            Evaluation::RejectedByThreshold => "rejected_by_threshold",
            Evaluation::Filtered { .. } => "filtered",
        }
    }
}

/// A resolved chain entry.
#[derive(Clone)]
pub(crate) struct ChainLink {
    pub name: Arc<str>,
    pub filter: Arc<dyn Filter>,
}

/// Evaluates entities against one proxy's filter chain.
pub struct FilterEngine {
    proxy: Arc<str>,
    chain: Vec<ChainLink>,
    policy: ThresholdPolicy,
    store: SharedVerdictStore,
}

impl FilterEngine {
    /// Resolve `chain` against `registry`. Every name must exist.
    pub fn new(
        proxy: &str,
        chain: &[String],
        registry: &FilterSet,
        policy: ThresholdPolicy,
        store: SharedVerdictStore,
    ) -> Result<Self, EngineError> {
        let chain = chain
            .iter()
            .map(|name| {
                registry
                    .get(name)
                    .map(|filter| ChainLink {
                        name: Arc::from(name.as_str()),
                        filter,
                    })
                    .ok_or_else(|| EngineError::UnknownFilter {
                        proxy: proxy.to_string(),
                        filter: name.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(proxy = %proxy, filters = chain.len(), ?policy, "filter engine ready");

        Ok(Self {
            proxy: Arc::from(proxy),
            chain,
            policy,
            store,
        })
    }

    pub fn proxy(&self) -> &str {
        &self.proxy
    }

    pub fn policy(&self) -> ThresholdPolicy {
        self.policy
    }

    pub fn chain_len(&self) -> usize {
        self.chain.len()
    }

    /// `true` if the entity may reach the backend.
    pub async fn run_filters(&self, entity: Arc<dyn Entity>) -> bool {
        self.evaluate(entity).await.is_accepted()
    }

    /// Evaluate `entity`. Never fails.
    pub async fn evaluate(&self, entity: Arc<dyn Entity>) -> Evaluation {
        let started = Instant::now();
        let ip = entity.ip().to_string();

        let verdict = self.store.get_verdict(&ip).unwrap_or_else(|e| {
            warn!(proxy = %self.proxy, ip = %ip, error = %e, "verdict lookup failed");
            counters::store_error("get_verdict");
            Verdict::default()
        });

        let evaluation = match self.policy.evaluate(&verdict) {
            ThresholdDecision::Allowlisted => {
                debug!(proxy = %self.proxy, ip = %ip, accepts = verdict.accepts, "identity allow-listed");
                Evaluation::Allowlisted
            }
            ThresholdDecision::Rejected => {
                info!(proxy = %self.proxy, ip = %ip, rejects = verdict.rejects, "identity rejected by threshold");
                Evaluation::RejectedByThreshold
            }
            ThresholdDecision::Evaluate => self.apply_chain(&ip, entity).await,
        };

        counters::evaluation(
            &self.proxy,
            evaluation.as_str(),
            started.elapsed().as_secs_f64(),
        );

        evaluation
    }

    async fn apply_chain(&self, ip: &str, entity: Arc<dyn Entity>) -> Evaluation {
        let slots = prime::prime(&self.proxy, &entity, &self.chain).await;

        // Every slot stays locked until the evaluation returns.
        let mut held = Vec::with_capacity(slots.len());

        for (index, link) in self.chain.iter().enumerate() {
            if let Some(guard) = slots.acquire(index).await {
                held.push(guard);
            }

            let result = link.filter.apply(entity.as_ref()).await;
            if let Err(e) = &result {
                warn!(
                    proxy = %self.proxy,
                    ip = %ip,
                    filter = %link.name,
                    error = %e,
                    "filter apply failed, skipping"
                );
                counters::filter_error(&self.proxy, &link.name, "apply");
            }

            let outcome = FilterOutcome::from_apply(&result);
            counters::filter_applied(&self.proxy, &link.name, outcome.as_str());

            if outcome.blocks() {
                self.bump(ip, Counter::Rejects);
                info!(
                    proxy = %self.proxy,
                    ip = %ip,
                    filter = %link.name,
                    protocol = entity.protocol(),
                    "entity filtered"
                );
                return Evaluation::Filtered {
                    filter: link.name.to_string(),
                    index,
                };
            }
        }

        self.bump(ip, Counter::Accepts);
        debug!(proxy = %self.proxy, ip = %ip, "entity accepted");
        Evaluation::Accepted
    }

    fn bump(&self, ip: &str, counter: Counter) {
        let (operation, result) = match counter {
            Counter::Accepts => ("inc_accepts", self.store.inc_accepts(ip)),
            Counter::Rejects => ("inc_rejects", self.store.inc_rejects(ip)),
        };

        if let Err(e) = result {
            warn!(proxy = %self.proxy, ip = %ip, error = %e, operation, "verdict update failed");
            counters::store_error(operation);
        }
    }
}
