use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for bounced
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Proxies accept inbound traffic and guard one backend each
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,

    /// Named filters, referenced by proxy filter chains
    #[serde(default)]
    pub filters: Vec<FilterConfig>,

    /// Verdict cache configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Admin API configuration
    #[serde(default)]
    pub admin: AdminConfig,

    /// Logging and tracing
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Shutdown behaviour
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// Proxy configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Proxy name (for logging/metrics)
    pub name: String,

    /// Transport
    #[serde(rename = "type")]
    pub kind: ProxyKind,

    /// Bind address
    pub listen: SocketAddr,

    /// Backend: a URL for HTTP proxies, `host:port` for TCP proxies
    pub target: String,

    /// Per-request deadline (defaults to 10s)
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,

    /// TLS material for the listening side
    pub tls: Option<TlsConfig>,

    /// Ordered filter chain (names from the `filters` section)
    #[serde(default)]
    pub filters: Vec<String>,

    /// Thresholds and action for filtered entities
    #[serde(default)]
    pub filter_settings: FilterSettings,
}

/// Transport handled by a proxy
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Http,
    Tcp,
}

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::Http => "http",
            ProxyKind::Tcp => "tcp",
        }
    }
}

/// TLS configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Path to certificate chain (PEM)
    pub cert: String,

    /// Path to private key (PEM)
    pub key: String,
}

/// What happens to a filtered entity
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Close the connection without answering
    #[default]
    Drop,
    /// Answer with a redirect to `url` (HTTP only)
    Redirect,
    /// Send the traffic to `url` instead of the target
    Proxy,
    /// Log only, forward to the target anyway
    None,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Drop => "drop",
            Action::Redirect => "redirect",
            Action::Proxy => "proxy",
            Action::None => "none",
        }
    }
}

/// Filter chain settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterSettings {
    /// Rejects after which an identity is dropped without filtering (0 = off)
    #[serde(default)]
    pub reject_threshold: u64,

    /// Accepts after which an identity is never rejected (0 = off)
    #[serde(default)]
    pub no_reject_threshold: u64,

    /// Action for filtered entities
    #[serde(default)]
    pub action: Action,

    /// Destination for `redirect` and `proxy` actions
    pub url: Option<String>,
}

/// Filter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    /// Name referenced by filter chains
    pub name: String,

    /// Filter type
    #[serde(rename = "type")]
    pub kind: FilterKind,

    /// Filter-specific parameters
    #[serde(default)]
    pub params: serde_yaml::Value,
}

/// Available filter types
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    Ip,
    Regexp,
    Header,
    Not,
}

/// Verdict store backend
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    Fjall,
}

/// Fjall backend settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FjallConfig {
    /// Data directory (defaults to the platform data dir)
    pub path: Option<PathBuf>,
}

/// Verdict store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    #[serde(default)]
    pub fjall: FjallConfig,

    /// Forget identities not seen for this long (unset = keep forever)
    #[serde(default, with = "humantime_serde::option")]
    pub retention: Option<Duration>,

    /// How often retention is enforced
    #[serde(default = "default_maintenance_interval", with = "humantime_serde")]
    pub maintenance_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            fjall: FjallConfig::default(),
            retention: None,
            maintenance_interval: default_maintenance_interval(),
        }
    }
}

impl StoreConfig {
    /// In-memory store.
    pub fn memory() -> Self {
        Self {
            backend: StorageBackend::Memory,
            ..Default::default()
        }
    }

    /// Fjall store rooted at `path`.
    pub fn fjall(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: StorageBackend::Fjall,
            fjall: FjallConfig {
                path: Some(path.into()),
            },
            ..Default::default()
        }
    }
}

fn default_maintenance_interval() -> Duration {
    Duration::from_secs(3600)
}

/// Admin API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API address
    #[serde(default = "default_admin_address")]
    pub address: SocketAddr,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_admin_address(),
        }
    }
}

fn default_admin_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_true() -> bool {
    true
}

/// Telemetry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable structured JSON logging
    #[serde(default)]
    pub json_logs: bool,

    /// OTLP endpoint for distributed tracing
    pub otlp_endpoint: Option<String>,

    /// Trace sample rate (0.0 - 1.0)
    #[serde(default = "default_sample_rate")]
    pub trace_sample_rate: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            otlp_endpoint: None,
            trace_sample_rate: default_sample_rate(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sample_rate() -> f64 {
    1.0
}

/// Shutdown configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// How long to wait for in-flight connections after a signal
    #[serde(default = "default_drain_timeout", with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: default_drain_timeout(),
        }
    }
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Humantime serde support module
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
