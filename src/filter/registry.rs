//! Name to filter lookup.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::not::NotParams;
use super::{
    parse_params, Filter, FilterError, HeaderFilter, IpFilter, NotFilter, RegexpFilter,
};
use crate::config::{FilterConfig, FilterKind};

/// Registry of named filters.
///
/// Read-only once built, so proxies share it without locking.
#[derive(Default)]
pub struct FilterSet {
    filters: HashMap<String, Arc<dyn Filter>>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured filter, in declaration order.
    ///
    /// `not` filters may only wrap filters declared before them.
    pub fn from_config(configs: &[FilterConfig]) -> Result<Self, FilterError> {
        let mut set = Self::new();

        for config in configs {
            let name = config.name.as_str();
            let filter: Arc<dyn Filter> = match config.kind {
                FilterKind::Ip => Arc::new(IpFilter::from_params(name, &config.params)?),
                FilterKind::Regexp => Arc::new(RegexpFilter::from_params(name, &config.params)?),
                FilterKind::Header => Arc::new(HeaderFilter::from_params(name, &config.params)?),
                FilterKind::Not => {
                    let params: NotParams = parse_params(name, &config.params)?;
                    let inner =
                        set.get(&params.filter)
                            .ok_or_else(|| FilterError::UnknownReference {
                                filter: name.to_string(),
                                target: params.filter.clone(),
                            })?;
                    Arc::new(NotFilter::new(inner))
                }
            };

            set.insert(name, filter)?;
            debug!(filter = %name, kind = ?config.kind, "filter registered");
        }

        Ok(set)
    }

    /// Register a filter under `name`.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        filter: Arc<dyn Filter>,
    ) -> Result<(), FilterError> {
        let name = name.into();
        if self.filters.contains_key(&name) {
            return Err(FilterError::Duplicate(name));
        }
        self.filters.insert(name, filter);
        Ok(())
    }

    /// Look up a filter by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Filter>> {
        self.filters.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configs(yaml: &str) -> Vec<FilterConfig> {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_from_config() {
        let set = FilterSet::from_config(&configs(
            r#"
- name: blocklist
  type: ip
  params: { list: ["10.0.0.0/8"] }
- name: allowlist
  type: not
  params: { filter: blocklist }
- name: ua
  type: header
  params: { header: user-agent, patterns: ["curl"] }
"#,
        ))
        .unwrap();

        assert_eq!(set.len(), 3);
        assert!(set.get("allowlist").is_some());
        assert!(set.get("geo").is_none());
    }

    #[test]
    fn test_not_requires_prior_declaration() {
        let err = FilterSet::from_config(&configs(
            r#"
- name: allowlist
  type: not
  params: { filter: blocklist }
- name: blocklist
  type: ip
  params: { list: ["10.0.0.0/8"] }
"#,
        ))
        .err()
        .unwrap();

        assert!(matches!(err, FilterError::UnknownReference { .. }));
    }

    #[test]
    fn test_duplicate_name() {
        let mut set = FilterSet::new();
        set.insert("a", Arc::new(IpFilter::new(vec![]))).unwrap();
        let err = set.insert("a", Arc::new(IpFilter::new(vec![]))).unwrap_err();
        assert!(matches!(err, FilterError::Duplicate(name) if name == "a"));
    }
}
