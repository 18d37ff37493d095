//! Runtime configuration for the P2P node
//!
//! Loaded from a JSON file; every field has a default so a partial file
//! (or no file at all) yields a working node.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Well-known listen port
pub const DEFAULT_PORT: u16 = 13802;

/// External port used for the first NAT mapping attempt
pub const DEFAULT_NAT_PORT: u16 = 23802;

/// Hard upper bound on outbound peers
pub const MAX_OUTBOUND: usize = 25;

/// Outbound count at which the dial scheduler stops dialing
pub const STABLE_OUTBOUND: usize = 15;

/// Built-in seeds appended when `inner_seed_enable` is set
pub const INNER_SEEDS: &[&str] = &[
    "39.107.234.240:13802",
    "39.105.88.66:13802",
    "39.105.87.114:13802",
    "120.27.234.254:13802",
    "116.62.169.41:13802",
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// P2P configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    /// Seed addresses (`ip:port`)
    pub seeds: Vec<String>,
    /// This node is itself a seed
    pub is_seed: bool,
    /// Append `INNER_SEEDS` to `seeds`
    pub inner_seed_enable: bool,
    /// Accept inbound connections
    pub server_start: bool,
    pub default_port: u16,
    pub default_nat_port: u16,
    pub max_outbound: usize,
    pub stable_outbound: usize,
    /// Directory holding the address database
    pub data_dir: PathBuf,
    /// Remote bootstrap list (newline or comma separated `ip:port`)
    pub bootstrap_url: Option<String>,
    pub nat: NatConfig,
    pub monitor: MonitorConfig,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            is_seed: false,
            inner_seed_enable: false,
            server_start: true,
            default_port: DEFAULT_PORT,
            default_nat_port: DEFAULT_NAT_PORT,
            max_outbound: MAX_OUTBOUND,
            stable_outbound: STABLE_OUTBOUND,
            data_dir: PathBuf::from(".p2p_data"),
            bootstrap_url: None,
            nat: NatConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl P2pConfig {
    /// Load a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Write this config as pretty JSON
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }

    /// Seeds with the built-in list appended when enabled
    pub fn effective_seeds(&self) -> Vec<String> {
        let mut seeds = self.seeds.clone();
        if self.inner_seed_enable {
            for seed in INNER_SEEDS {
                if !seeds.iter().any(|s| s == seed) {
                    seeds.push(seed.to_string());
                }
            }
        }
        seeds
    }
}

/// NAT traversal settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatConfig {
    /// Use UPnP; when false every mapping request fails
    pub enabled: bool,
    pub try_map_port_times: u32,
    pub lease_secs: u64,
    pub renew_interval_secs: u64,
    pub renew_retry_ms: u64,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            try_map_port_times: 20,
            lease_secs: 48 * 60 * 60,
            renew_interval_secs: 45 * 60 * 60,
            renew_retry_ms: 1000,
        }
    }
}

impl NatConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_secs(self.renew_interval_secs)
    }

    pub fn renew_retry(&self) -> Duration {
        Duration::from_millis(self.renew_retry_ms)
    }
}

/// Maintenance loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub online_discovery_secs: u64,
    pub offline_discovery_secs: u64,
    pub bootstrap_discovery_secs: u64,
    pub peer_info_secs: u64,
    pub dial_secs: u64,
    pub blacklist_secs: u64,
    pub filter_secs: u64,
    pub heartbeat_secs: u64,
    pub dial_timeout_ms: u64,
    /// Consecutive heartbeat failures before a peer reports itself
    pub max_peer_errors: u32,
    /// Ban applied to addresses that keep failing
    pub ban_secs: u64,
    pub filter_ttl_secs: u64,
    /// Delay between local address detection attempts
    pub detect_retry_secs: u64,
    /// Whole-request timeout for the bootstrap list
    pub bootstrap_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            online_discovery_secs: 30,
            offline_discovery_secs: 60,
            bootstrap_discovery_secs: 60 * 60,
            peer_info_secs: 10,
            dial_secs: 5,
            blacklist_secs: 10,
            filter_secs: 30,
            heartbeat_secs: 10,
            dial_timeout_ms: 5000,
            max_peer_errors: 3,
            ban_secs: 60 * 60,
            filter_ttl_secs: 60,
            detect_retry_secs: 5,
            bootstrap_timeout_secs: 30,
        }
    }
}

impl MonitorConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn ban(&self) -> Duration {
        Duration::from_secs(self.ban_secs)
    }

    pub fn filter_ttl(&self) -> Duration {
        Duration::from_secs(self.filter_ttl_secs)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let cfg: P2pConfig = serde_json::from_str(r#"{"is_seed": true}"#).unwrap();
        assert!(cfg.is_seed);
        assert!(cfg.server_start);
        assert_eq!(cfg.default_port, DEFAULT_PORT);
        assert_eq!(cfg.nat.try_map_port_times, 20);
    }

    #[test]
    fn test_inner_seeds_appended_once() {
        let cfg = P2pConfig {
            seeds: vec![INNER_SEEDS[0].to_string()],
            inner_seed_enable: true,
            ..Default::default()
        };
        let seeds = cfg.effective_seeds();
        assert_eq!(seeds.len(), INNER_SEEDS.len());

        let cfg = P2pConfig::default();
        assert!(cfg.effective_seeds().is_empty());
    }

    #[test]
    fn test_save_load_config() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("p2p.json");

        let cfg = P2pConfig {
            seeds: vec!["1.2.3.4:13802".to_string()],
            ..Default::default()
        };
        cfg.save(&path).unwrap();

        let loaded = P2pConfig::load(&path).unwrap();
        assert_eq!(loaded.seeds, cfg.seeds);
        assert_eq!(loaded.nat.lease_secs, cfg.nat.lease_secs);
    }
}
