//! Node configuration
//!
//! Loaded from a JSON file when one is given, otherwise built from defaults
//! with command-line overrides applied on top.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network: NetworkConfig,
    pub audit: AuditConfig,
}

impl NodeConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the peer listener binds to.
    pub listen_addr: String,
    /// Chain identity string; sessions form only between equal chains.
    pub chain_id: String,
    pub handshake_timeout_secs: u64,
    /// How long one chunked block fetch may stay in flight.
    pub block_fetch_ttl_secs: u64,
}

impl NetworkConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn block_fetch_ttl(&self) -> Duration {
        Duration::from_secs(self.block_fetch_ttl_secs)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            listen_addr: "0.0.0.0:7846".to_string(),
            chain_id: "lumen-main".to_string(),
            handshake_timeout_secs: 10,
            block_fetch_ttl_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Master switch; off selects a blacklist that never bans anything.
    pub enable_audit: bool,
    /// Per-session penalty scoring; off still keeps the persistent blacklist.
    pub runtime_audit: bool,
    pub prune_interval_secs: u64,
    pub prune_ttl_days: i64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        AuditConfig {
            enable_audit: true,
            runtime_audit: true,
            prune_interval_secs: 3600,
            prune_ttl_days: 730,
        }
    }
}
