//! Regex filter over raw request bytes or the body.

use async_trait::async_trait;
use regex::bytes::RegexSet;
use serde::Deserialize;

use super::{parse_params, Filter, FilterError};
use crate::entity::Entity;

/// Which part of the entity the patterns run against.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RegexpTarget {
    /// Full wire-format capture
    #[default]
    Raw,
    /// Body only
    Body,
}

#[derive(Debug, Deserialize)]
struct RegexpParams {
    patterns: Vec<String>,
    #[serde(default)]
    target: RegexpTarget,
}

/// Filters entities where any pattern matches.
#[derive(Debug, Clone)]
pub struct RegexpFilter {
    set: RegexSet,
    target: RegexpTarget,
}

impl RegexpFilter {
    pub fn new(set: RegexSet, target: RegexpTarget) -> Self {
        Self { set, target }
    }

    pub fn from_params(name: &str, params: &serde_yaml::Value) -> Result<Self, FilterError> {
        let params: RegexpParams = parse_params(name, params)?;

        let set = RegexSet::new(&params.patterns).map_err(|e| FilterError::Params {
            filter: name.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self::new(set, params.target))
    }
}

#[async_trait]
impl Filter for RegexpFilter {
    async fn apply(&self, entity: &dyn Entity) -> Result<bool, FilterError> {
        let data = match self.target {
            RegexpTarget::Raw => entity.raw().await?,
            RegexpTarget::Body => entity.body().await?,
        };
        Ok(self.set.is_match(&data))
    }
}
