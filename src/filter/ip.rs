//! Address list filter.

use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::IpNet;
use serde::Deserialize;

use super::{parse_params, Filter, FilterError};
use crate::entity::Entity;

#[derive(Debug, Deserialize)]
struct IpParams {
    list: Vec<String>,
}

/// Filters identities inside any of the listed networks.
#[derive(Debug, Clone)]
pub struct IpFilter {
    networks: Vec<IpNet>,
}

impl IpFilter {
    pub fn new(networks: Vec<IpNet>) -> Self {
        Self { networks }
    }

    /// Build from `params: { list: [...] }`. Entries are CIDRs or bare addresses.
    pub fn from_params(name: &str, params: &serde_yaml::Value) -> Result<Self, FilterError> {
        let params: IpParams = parse_params(name, params)?;

        let networks = params
            .list
            .iter()
            .map(|entry| parse_network(entry.trim()))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| FilterError::Params {
                filter: name.to_string(),
                reason: "list entries must be addresses or CIDR networks".to_string(),
            })?;

        Ok(Self::new(networks))
    }
}

fn parse_network(entry: &str) -> Option<IpNet> {
    if entry.contains('/') {
        entry.parse::<IpNet>().ok()
    } else {
        entry.parse::<IpAddr>().ok().map(IpNet::from)
    }
}

#[async_trait]
impl Filter for IpFilter {
    async fn apply(&self, entity: &dyn Entity) -> Result<bool, FilterError> {
        let ip = entity.ip();
        Ok(self.networks.iter().any(|net| net.contains(&ip)))
    }
}
