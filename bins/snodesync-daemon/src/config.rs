use serde::Deserialize;
use snodesync_core::config::{CoreConfig, SyncMode, MINIMUM_SWARM_NODES};
use snodesync_core::ids::AccountKey;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Clone, Debug, Deserialize)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub identity: IdentityConfig,
    pub seed: SeedConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct IdentityConfig {
    pub account_key: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SeedConfig {
    pub url: String,
    pub port: u16,
    #[serde(default = "default_seed_limit")]
    pub limit: usize,
    #[serde(default = "default_minimum_swarm_nodes")]
    pub minimum_swarm_nodes: usize,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncModeSetting {
    SharedConfig,
    Legacy,
    #[default]
    Both,
}

impl From<SyncModeSetting> for SyncMode {
    fn from(setting: SyncModeSetting) -> Self {
        match setting {
            SyncModeSetting::SharedConfig => SyncMode::SharedConfig,
            SyncModeSetting::Legacy => SyncMode::Legacy,
            SyncModeSetting::Both => SyncMode::Both,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct SyncConfig {
    #[serde(default)]
    pub mode: SyncModeSetting,
    #[serde(default)]
    pub registration_done: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_refresh_secs")]
    pub interval_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_refresh_secs(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

fn default_seed_limit() -> usize {
    snodesync_core::config::DEFAULT_SEED_NODE_LIMIT
}

fn default_minimum_swarm_nodes() -> usize {
    MINIMUM_SWARM_NODES
}

fn default_refresh_secs() -> u64 {
    60
}

fn default_bind_addr() -> String {
    "127.0.0.1:9180".to_string()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io")]
    Io,
    #[error("parse")]
    Parse,
    #[error("invalid {0}")]
    Invalid(String),
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if AccountKey::from_hex(&self.identity.account_key).is_none() {
            return Err(ConfigError::Invalid("identity.account_key".to_string()));
        }
        let url = self.seed.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid("seed.url".to_string()));
        }
        if self.seed.limit == 0 {
            return Err(ConfigError::Invalid("seed.limit".to_string()));
        }
        if self.refresh.interval_secs == 0 {
            return Err(ConfigError::Invalid("refresh.interval_secs".to_string()));
        }
        self.api
            .bind_addr
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::Invalid("api.bind_addr".to_string()))?;
        Ok(())
    }

    pub fn account_key(&self) -> Result<AccountKey, ConfigError> {
        AccountKey::from_hex(&self.identity.account_key)
            .ok_or_else(|| ConfigError::Invalid("identity.account_key".to_string()))
    }

    pub fn core_config(&self) -> CoreConfig {
        CoreConfig {
            seed_node_url: self.seed.url.trim().trim_end_matches('/').to_string(),
            seed_node_port: self.seed.port,
            seed_node_limit: self.seed.limit,
            minimum_swarm_nodes: self.seed.minimum_swarm_nodes,
            sync_mode: self.sync.mode.clone().into(),
            registration_done: self.sync.registration_done,
        }
    }
}

pub fn load_config(path: &Path) -> Result<DaemonConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
    toml::from_str(&content).map_err(|_| ConfigError::Parse)
}
