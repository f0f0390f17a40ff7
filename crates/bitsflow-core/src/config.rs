//! Configuration system for Bitsflow.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $BITSFLOW_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/bitsflow/config.toml
//!   3. ~/.config/bitsflow/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{DEFAULT_MAX_MESSAGE_SIZE, HANDSHAKE_TIMEOUT_SECS};

/// Block number whose root marks a fully synced ledger.
pub const CHECKPOINT_BLOCK: u64 = 395_964;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BitsflowConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub trackers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Hex node id. Empty = random per process.
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_addr: String,
    /// TCP port for peer sessions. 0 = OS-assigned.
    pub port: u16,
    /// HTTP status endpoint port. 0 = disabled.
    pub api_port: u16,
    /// `host:port` peers dialled at startup.
    pub bootstrap_peers: Vec<String>,
    /// Largest accepted frame payload.
    pub max_message_size: u32,
    pub handshake_timeout_secs: u64,
    /// Period of the Status frame sent to each peer.
    pub status_interval_secs: u64,
    pub disable_dht: bool,
    pub disable_tcp: bool,
    pub disable_utp: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for artifact payloads, one sub-directory per content hash.
    pub data_dir: PathBuf,
    /// JSON ledger file.
    pub ledger_path: PathBuf,
}

/// Eager or on-demand fetching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Full,
    Lazy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub mode: Mode,
    /// Pending queue retry tick.
    pub fast_tick_ms: u64,
    /// Status log tick.
    pub status_tick_secs: u64,
    pub pending_capacity: usize,
    /// Buffer of the need-event channel.
    pub need_queue: usize,
    pub tunnel_ttl_secs: u64,
    /// Hashes fetched immediately regardless of their request size.
    pub good_hashes: Vec<String>,
    /// Hashes scheduled at startup when the ledger is behind.
    pub seed_hashes: Vec<String>,
    pub checkpoint_block: u64,
    pub poll_initial_ms: u64,
    pub poll_interval_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".into(),
            port: 40404,
            api_port: 0,
            bootstrap_peers: Vec::new(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            handshake_timeout_secs: HANDSHAKE_TIMEOUT_SECS,
            status_interval_secs: 30,
            disable_dht: false,
            disable_tcp: false,
            disable_utp: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: data_dir().join("artifacts"),
            ledger_path: data_dir().join("ledger.json"),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Full,
            fast_tick_ms: 3000,
            status_tick_secs: 60,
            pending_capacity: 1024,
            need_queue: 64,
            tunnel_ttl_secs: 60,
            good_hashes: Vec::new(),
            seed_hashes: Vec::new(),
            checkpoint_block: CHECKPOINT_BLOCK,
            poll_initial_ms: 500,
            poll_interval_ms: 100,
        }
    }
}

impl NetworkConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs.max(1))
    }
}

impl SchedulerConfig {
    pub fn fast_tick(&self) -> Duration {
        Duration::from_millis(self.fast_tick_ms.max(1))
    }

    pub fn status_tick(&self) -> Duration {
        Duration::from_secs(self.status_tick_secs.max(1))
    }

    pub fn tunnel_ttl(&self) -> Duration {
        Duration::from_secs(self.tunnel_ttl_secs)
    }

    pub fn poll_initial(&self) -> Duration {
        Duration::from_millis(self.poll_initial_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl IdentityConfig {
    /// Configured id, or a fresh random one.
    pub fn resolve_node_id(&self) -> String {
        if !self.node_id.is_empty() {
            return self.node_id.clone();
        }
        let bytes: [u8; 16] = rand::random();
        hex::encode(bytes)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("bitsflow")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("bitsflow")
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

impl BitsflowConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            BitsflowConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("BITSFLOW_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&BitsflowConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply BITSFLOW_<SECTION>__<KEY> overrides read through `var`.
    pub fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        let flag = |v: String| v == "true" || v == "1";

        if let Some(v) = var("BITSFLOW_IDENTITY__NODE_ID") {
            self.identity.node_id = v;
        }
        if let Some(v) = var("BITSFLOW_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Some(p) = var("BITSFLOW_NETWORK__PORT").and_then(|v| v.parse().ok()) {
            self.network.port = p;
        }
        if let Some(p) = var("BITSFLOW_NETWORK__API_PORT").and_then(|v| v.parse().ok()) {
            self.network.api_port = p;
        }
        if let Some(v) = var("BITSFLOW_NETWORK__BOOTSTRAP_PEERS") {
            self.network.bootstrap_peers = split_list(&v);
        }
        if let Some(n) = var("BITSFLOW_NETWORK__MAX_MESSAGE_SIZE").and_then(|v| v.parse().ok()) {
            self.network.max_message_size = n;
        }
        if let Some(v) = var("BITSFLOW_NETWORK__DISABLE_DHT") {
            self.network.disable_dht = flag(v);
        }
        if let Some(v) = var("BITSFLOW_NETWORK__DISABLE_TCP") {
            self.network.disable_tcp = flag(v);
        }
        if let Some(v) = var("BITSFLOW_NETWORK__DISABLE_UTP") {
            self.network.disable_utp = flag(v);
        }
        if let Some(v) = var("BITSFLOW_STORAGE__DATA_DIR") {
            self.storage.data_dir = PathBuf::from(v);
        }
        if let Some(v) = var("BITSFLOW_STORAGE__LEDGER_PATH") {
            self.storage.ledger_path = PathBuf::from(v);
        }
        if let Some(v) = var("BITSFLOW_SCHEDULER__MODE") {
            match v.to_ascii_lowercase().as_str() {
                "full" => self.scheduler.mode = Mode::Full,
                "lazy" => self.scheduler.mode = Mode::Lazy,
                _ => {}
            }
        }
        if let Some(n) = var("BITSFLOW_SCHEDULER__PENDING_CAPACITY").and_then(|v| v.parse().ok()) {
            self.scheduler.pending_capacity = n;
        }
        if let Some(v) = var("BITSFLOW_SCHEDULER__GOOD_HASHES") {
            self.scheduler.good_hashes = split_list(&v);
        }
        if let Some(v) = var("BITSFLOW_TRACKERS") {
            self.trackers = split_list(&v);
        }
    }
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
