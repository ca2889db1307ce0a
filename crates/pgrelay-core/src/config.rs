//! pgrelay.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_packet_read_size() -> usize {
    4096
}

fn default_workers() -> u32 {
    1
}

/// Pooler-level settings plus the ordered routing rule list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolerConfig {
    /// Global cap on concurrently routed clients. `None` disables the cap.
    pub client_max: Option<u32>,
    /// Chunk size for the backend packet reader, in bytes.
    #[serde(default = "default_packet_read_size")]
    pub packet_read_size: usize,
    /// Number of worker event loops.
    #[serde(default = "default_workers")]
    pub workers: u32,
    /// Routing rules in priority order; first match wins.
    #[serde(default, rename = "rule")]
    pub rules: Vec<RuleConfig>,
}

impl Default for PoolerConfig {
    fn default() -> Self {
        Self {
            client_max: None,
            packet_read_size: default_packet_read_size(),
            workers: default_workers(),
            rules: Vec::new(),
        }
    }
}

impl PoolerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PoolerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Whether server sockets migrate between worker event loops.
    pub fn is_multi_workers(&self) -> bool {
        self.workers > 1
    }
}

/// One routing rule: a `(database, user)` selector, the upstream it maps
/// to, and the pool limits applied to clients landing on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Database selector; `"*"` matches any.
    pub database: String,
    /// User selector; `"*"` matches any.
    pub user: String,
    /// Upstream endpoint clients matching this rule are pooled against.
    pub storage: StorageConfig,
    /// Override the database name used for the backend pool.
    pub storage_db: Option<String>,
    /// Override the user name used for the backend pool.
    pub storage_user: Option<String>,
    /// Cap on concurrent backend servers; `0` means always open a new
    /// connection and never wait.
    #[serde(default)]
    pub pool_size: u32,
    /// Idle server TTL in seconds; `0` disables expiry.
    #[serde(default)]
    pub pool_ttl: u64,
    /// Per-rule cap on routed clients. `None` disables the cap.
    pub client_max: Option<u32>,
}

/// An upstream database endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
}
