//! Filters: named, independent units of judgement.
//!
//! Every filter has two phases:
//! - `prepare`: optional context building (lookups, caches), run
//!   concurrently for the whole chain before anything is applied
//! - `apply`: the verdict, run in chain order
//!
//! Built-in filters:
//! - `ip`: address/CIDR list
//! - `regexp`: regexes over the raw request or the body
//! - `header`: regexes over one header's values
//! - `not`: inverts another filter

mod header;
mod ip;
mod not;
mod regexp;
mod registry;

pub use header::HeaderFilter;
pub use ip::IpFilter;
pub use not::NotFilter;
pub use regexp::{RegexpFilter, RegexpTarget};
pub use registry::FilterSet;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::entity::{Entity, EntityError};

/// Filter error.
#[derive(Debug, Error)]
pub enum FilterError {
    /// The entity could not provide what the filter needs.
    #[error(transparent)]
    Entity(#[from] EntityError),

    /// Invalid filter parameters.
    #[error("invalid params for filter \"{filter}\": {reason}")]
    Params { filter: String, reason: String },

    /// A filter wraps a name that was not declared before it.
    #[error("filter \"{filter}\" references unknown filter \"{target}\"")]
    UnknownReference { filter: String, target: String },

    /// Two filters share a name.
    #[error("duplicate filter name \"{0}\"")]
    Duplicate(String),
}

/// A named unit of judgement over an [`Entity`].
///
/// `prepare` runs on a spawned worker concurrently with the other filters'
/// `prepare`; `apply` runs from the sequential loop once this filter's
/// `prepare` has finished. Filters must not assume any ordering relative
/// to each other.
#[async_trait]
pub trait Filter: Send + Sync {
    /// Build context ahead of `apply`.
    async fn prepare(&self, _entity: &dyn Entity) -> Result<(), FilterError> {
        Ok(())
    }

    /// Return `true` if the entity must be filtered.
    async fn apply(&self, entity: &dyn Entity) -> Result<bool, FilterError>;
}

/// Result of applying one filter, as seen by the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    Pass,
    Filtered,
    /// The filter failed; it neither passes nor fails the entity.
    Indeterminate,
}

impl FilterOutcome {
    /// Fold an `apply` result; errors become `Indeterminate`.
    pub fn from_apply(result: &Result<bool, FilterError>) -> Self {
        match result {
            Ok(filtered) => Self::from(*filtered),
            Err(_) => FilterOutcome::Indeterminate,
        }
    }

    /// Whether this outcome stops the chain.
    ///
    /// `Indeterminate` folds into `Pass`: a broken filter degrades
    /// accuracy, never availability.
    pub fn blocks(self) -> bool {
        matches!(self, FilterOutcome::Filtered)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FilterOutcome::Pass => "pass",
            FilterOutcome::Filtered => "filtered",
            FilterOutcome::Indeterminate => "indeterminate",
        }
    }
}

impl From<bool> for FilterOutcome {
    fn from(filtered: bool) -> Self {
        if filtered {
            FilterOutcome::Filtered
        } else {
            FilterOutcome::Pass
        }
    }
}

/// Decode a filter's `params` block.
pub(crate) fn parse_params<T: DeserializeOwned>(
    filter: &str,
    params: &serde_yaml::Value,
) -> Result<T, FilterError> {
    serde_yaml::from_value(params.clone()).map_err(|e| FilterError::Params {
        filter: filter.to_string(),
        reason: e.to_string(),
    })
}
