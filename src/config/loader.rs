use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::types::Config;

impl Config {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        debug!(path = %path.display(), "loading configuration");

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(yaml).context("failed to parse YAML configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.proxies.is_empty() {
            anyhow::bail!("at least one proxy must be defined");
        }

        let mut filter_names = HashSet::new();
        for filter in &self.filters {
            if !filter_names.insert(filter.name.as_str()) {
                anyhow::bail!("duplicate filter name: {}", filter.name);
            }
        }

        let mut proxy_names = HashSet::new();
        for proxy in &self.proxies {
            if !proxy_names.insert(proxy.name.as_str()) {
                anyhow::bail!("duplicate proxy name: {}", proxy.name);
            }

            for name in &proxy.filters {
                if !filter_names.contains(name.as_str()) {
                    anyhow::bail!(
                        "can't find filter \"{}\" for proxy \"{}\"",
                        name,
                        proxy.name
                    );
                }
            }
        }

        if !(0.0..=1.0).contains(&self.telemetry.trace_sample_rate) {
            anyhow::bail!(
                "trace_sample_rate must be within 0.0..=1.0, got {}",
                self.telemetry.trace_sample_rate
            );
        }

        info!("configuration validated successfully");
        Ok(())
    }
}
