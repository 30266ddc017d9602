// Copyright (c) 2024 Botho Foundation

//! Construction-time configuration record for a node (§6 "CLI /
//! configuration surface of the core"). Loadable from TOML, following the
//! same `load`/`save` pattern the rest of the ambient stack uses.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::peer_id::PeerId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Fixed identity; a random one is drawn at startup if absent.
    #[serde(default)]
    pub peer_id: Option<PeerId>,

    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    #[serde(default = "default_min_peers")]
    pub min_peers: usize,
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    #[serde(default = "default_true")]
    pub auto_discovery: bool,
    #[serde(default = "default_true")]
    pub eviction_enabled: bool,
    #[serde(default = "default_true")]
    pub xor_routing_enabled: bool,

    #[serde(default = "default_true")]
    pub dht_enabled: bool,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,
    #[serde(default = "default_ttl_sweep_interval")]
    pub ttl_sweep_interval_secs: u64,
    #[serde(default = "default_seen_set_capacity")]
    pub seen_set_capacity: usize,

    pub hub_uri: String,
    #[serde(default)]
    pub bootstrap_hubs: Vec<String>,

    #[serde(default = "default_reconnect_backoff_base")]
    pub reconnect_backoff_base_ms: u64,
    #[serde(default = "default_reconnect_backoff_cap")]
    pub reconnect_backoff_cap_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default)]
    pub telemetry: crate::telemetry::TelemetryConfig,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_max_peers() -> usize {
    6
}
fn default_min_peers() -> usize {
    2
}
fn default_true() -> bool {
    true
}
fn default_replication_factor() -> usize {
    3
}
fn default_ttl_sweep_interval() -> u64 {
    30
}
fn default_seen_set_capacity() -> usize {
    crate::envelope::DEFAULT_SEEN_SET_CAPACITY
}
fn default_reconnect_backoff_base() -> u64 {
    500
}
fn default_reconnect_backoff_cap() -> u64 {
    30_000
}
fn default_max_reconnect_attempts() -> u32 {
    20
}

pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".peerpigeon")
}

pub fn default_config_path() -> PathBuf {
    default_data_dir().join("config.toml")
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_id: None,
            max_peers: default_max_peers(),
            min_peers: default_min_peers(),
            auto_connect: true,
            auto_discovery: true,
            eviction_enabled: true,
            xor_routing_enabled: true,
            dht_enabled: true,
            replication_factor: default_replication_factor(),
            ttl_sweep_interval_secs: default_ttl_sweep_interval(),
            seen_set_capacity: default_seen_set_capacity(),
            hub_uri: "wss://127.0.0.1:9000".to_string(),
            bootstrap_hubs: Vec::new(),
            reconnect_backoff_base_ms: default_reconnect_backoff_base(),
            reconnect_backoff_cap_ms: default_reconnect_backoff_cap(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            telemetry: crate::telemetry::TelemetryConfig::default(),
            data_dir: default_data_dir(),
        }
    }
}

impl NodeConfig {
    pub fn reconnect_backoff_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_base_ms)
    }

    pub fn reconnect_backoff_cap(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_cap_ms)
    }

    pub fn ttl_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.ttl_sweep_interval_secs)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file at {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("failed to write config file at {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, perms)
                .with_context(|| format!("failed to set permissions on {}", path.display()))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_degree_bounds() {
        let config = NodeConfig::default();
        assert!(config.min_peers <= config.max_peers);
        assert!(config.replication_factor >= 1);
    }

    #[test]
    fn round_trips_through_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = NodeConfig::default();
        config.hub_uri = "wss://hub.example:9000".to_string();
        config.max_peers = 12;
        config.save(&path).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.hub_uri, config.hub_uri);
        assert_eq!(loaded.max_peers, 12);
    }

    #[cfg(unix)]
    #[test]
    fn saved_config_is_not_world_readable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        NodeConfig::default().save(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let toml_str = r#"hub_uri = "wss://hub.example:9000""#;
        let config: NodeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_peers, default_max_peers());
        assert!(config.auto_connect);
    }
}
