//! Inverting filter.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{Filter, FilterError};
use crate::entity::Entity;

#[derive(Debug, Deserialize)]
pub(super) struct NotParams {
    pub filter: String,
}

/// Filters exactly what the wrapped filter lets through.
pub struct NotFilter {
    inner: Arc<dyn Filter>,
}

impl NotFilter {
    pub fn new(inner: Arc<dyn Filter>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Filter for NotFilter {
    async fn prepare(&self, entity: &dyn Entity) -> Result<(), FilterError> {
        self.inner.prepare(entity).await
    }

    async fn apply(&self, entity: &dyn Entity) -> Result<bool, FilterError> {
        Ok(!self.inner.apply(entity).await?)
    }
}
