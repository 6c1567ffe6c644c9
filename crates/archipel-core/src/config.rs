//! Configuration system for Archipel.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $ARCHIPEL_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/archipel/config.toml
//!   3. ~/.config/archipel/config.toml

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::wire;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchipelConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub transfer: TransferConfig,
    pub trust: TrustConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Directory holding identity.json / identity_public.json. Auto-generated on first run.
    pub dir: PathBuf,
    /// Human label written into the identity files.
    pub node_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the transfer listener and discovery socket bind to.
    pub bind_addr: IpAddr,
    pub multicast_group: Ipv4Addr,
    pub discovery_port: u16,
    /// TCP port for transfer connections. 0 = OS-assigned.
    pub tcp_port: u16,
    /// Send HELLO on multicast and listen for others.
    pub discovery_enabled: bool,
    pub hello_interval_secs: u64,
    /// Peers silent for this many HELLO intervals are evicted.
    pub missed_hellos_before_eviction: u32,
    pub handshake_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    /// Sessions with this many unanswered PINGs in a row are closed.
    pub missed_pongs_before_close: u32,
    /// Pause before retrying a peer whose handshake failed.
    pub handshake_cooldown_secs: u64,
    pub max_handshake_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk size for files this node shares. Received manifests carry their own.
    pub chunk_size: u32,
    /// K: chunk requests in flight per transfer.
    pub max_in_flight: usize,
    pub request_timeout_secs: u64,
    /// Give up on a transfer once a single chunk has failed this many times.
    pub max_chunk_attempts: u32,
    /// How long a peer is skipped for a chunk it failed to deliver.
    pub peer_backoff_secs: u64,
    /// Where completed downloads are written.
    pub download_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Peer public keys (hex) promoted to TRUSTED at startup.
    pub trusted_peers: Vec<String>,
    /// Accept REVOKE certificates signed by a TRUSTED introducer, not only self-signed ones.
    pub allow_introducer_revocation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Chunk store, trust.json and manifests.json live here.
    pub data_dir: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            dir: config_dir().join("identity"),
            node_name: "node".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            multicast_group: wire::MULTICAST_GROUP,
            discovery_port: wire::DISCOVERY_PORT,
            tcp_port: wire::TCP_PORT,
            discovery_enabled: true,
            hello_interval_secs: wire::HELLO_INTERVAL_SECS,
            missed_hellos_before_eviction: 3,
            handshake_timeout_secs: 10,
            keepalive_interval_secs: 15,
            missed_pongs_before_close: 3,
            handshake_cooldown_secs: 60,
            max_handshake_attempts: 3,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 256 * 1024,
            max_in_flight: 8,
            request_timeout_secs: 10,
            max_chunk_attempts: 5,
            peer_backoff_secs: 30,
            download_dir: data_dir().join("downloads"),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: data_dir(),
        }
    }
}

impl NetworkConfig {
    pub fn hello_interval(&self) -> Duration {
        Duration::from_secs(self.hello_interval_secs.max(1))
    }

    /// Silence after which a non-connected peer record is evicted.
    pub fn peer_expiry(&self) -> Duration {
        self.hello_interval() * self.missed_hellos_before_eviction.max(1)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs.max(1))
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    pub fn handshake_cooldown(&self) -> Duration {
        Duration::from_secs(self.handshake_cooldown_secs)
    }
}

impl TransferConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn peer_backoff(&self) -> Duration {
        Duration::from_secs(self.peer_backoff_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("archipel")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("archipel")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ArchipelConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load a specific file, falling back to defaults if it does not exist.
    /// No environment overrides are applied.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(ArchipelConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("ARCHIPEL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text = toml::to_string_pretty(&ArchipelConfig::default())
            .map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply ARCHIPEL_* overrides. `lookup` is `std::env::var` in production.
    /// Unparseable values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ARCHIPEL_NETWORK__TCP_PORT") {
            if let Ok(p) = v.parse() {
                self.network.tcp_port = p;
            }
        }
        if let Some(v) = lookup("ARCHIPEL_NETWORK__DISCOVERY_PORT") {
            if let Ok(p) = v.parse() {
                self.network.discovery_port = p;
            }
        }
        if let Some(v) = lookup("ARCHIPEL_NETWORK__BIND_ADDR") {
            if let Ok(a) = v.parse() {
                self.network.bind_addr = a;
            }
        }
        if let Some(v) = lookup("ARCHIPEL_NETWORK__DISCOVERY_ENABLED") {
            self.network.discovery_enabled = v == "true" || v == "1";
        }
        if let Some(v) = lookup("ARCHIPEL_TRANSFER__CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                self.transfer.chunk_size = n;
            }
        }
        if let Some(v) = lookup("ARCHIPEL_TRANSFER__MAX_IN_FLIGHT") {
            if let Ok(n) = v.parse() {
                self.transfer.max_in_flight = n;
            }
        }
        if let Some(v) = lookup("ARCHIPEL_IDENTITY__DIR") {
            self.identity.dir = PathBuf::from(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = ArchipelConfig::default();
        assert_eq!(config.network.multicast_group, Ipv4Addr::new(239, 255, 42, 99));
        assert_eq!(config.network.discovery_port, 6000);
        assert_eq!(config.network.tcp_port, 7777);
        assert_eq!(config.network.hello_interval(), Duration::from_secs(30));
        assert_eq!(config.network.peer_expiry(), Duration::from_secs(90));
        assert_eq!(config.transfer.chunk_size, 262_144);
        assert_eq!(config.transfer.max_in_flight, 8);
        assert!(!config.trust.allow_introducer_revocation);
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let env: HashMap<&str, &str> = [
            ("ARCHIPEL_NETWORK__TCP_PORT", "9000"),
            ("ARCHIPEL_TRANSFER__MAX_IN_FLIGHT", "not-a-number"),
            ("ARCHIPEL_NETWORK__DISCOVERY_ENABLED", "0"),
        ]
        .into_iter()
        .collect();

        let mut config = ArchipelConfig::default();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.network.tcp_port, 9000);
        assert_eq!(config.transfer.max_in_flight, 8);
        assert!(!config.network.discovery_enabled);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[transfer]\nchunk_size = 65536\n").unwrap();

        let config = ArchipelConfig::load_from(&path).unwrap();
        assert_eq!(config.transfer.chunk_size, 65536);
        assert_eq!(config.transfer.max_in_flight, 8);
        assert_eq!(config.network.tcp_port, 7777);
    }

    #[test]
    fn written_default_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        ArchipelConfig::write_default_to(&path).unwrap();
        assert!(path.exists());

        let config = ArchipelConfig::load_from(&path).unwrap();
        assert_eq!(config.network.discovery_port, 6000);
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[network\n").unwrap();
        assert!(matches!(
            ArchipelConfig::load_from(&path),
            Err(ConfigError::ParseFailed(..))
        ));
    }
}
