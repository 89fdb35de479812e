//! Server configuration.
//!
//! Supports loading from YAML files; the `LISTEN_TOGETHER_*` environment
//! flags (parsed by the core) always win for the coordination knobs. The
//! YAML additionally seeds the in-memory collaborators (users, groups,
//! tracks) this standalone server runs with.

use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use listen_core::{CoreConfig, QueueItem, UserRecord};
use serde::Deserialize;

/// A user row for the standalone directory.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub token_version: u64,
}

/// Server configuration loaded from YAML.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the server to.
    pub bind_addr: IpAddr,

    /// Port to bind the server to.
    /// Override: `--port` / `LISTEN_BIND_PORT`.
    pub bind_port: u16,

    /// Redis URL for the snapshot store, cluster bus, and mutation lock.
    /// `REDIS_URL` wins when both are set.
    pub redis_url: Option<String>,

    /// Enables the read-only polling fallback.
    pub allow_polling: bool,

    /// Joinable groups to register at startup.
    pub groups: Vec<String>,

    /// Users known to the standalone directory.
    pub users: Vec<SeedUser>,

    /// Tracks known to the standalone catalog.
    pub tracks: Vec<QueueItem>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            bind_port: 49500,
            redis_url: None,
            allow_polling: false,
            groups: Vec::new(),
            users: Vec::new(),
            tracks: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, or defaults when none given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }

    /// Builds the core configuration: environment flags first, YAML filling
    /// the gaps.
    pub fn to_core_config(&self) -> CoreConfig {
        let mut config = CoreConfig::from_env();
        if config.redis_url.is_none() {
            config.redis_url = self.redis_url.clone();
        }
        config.allow_polling = config.allow_polling || self.allow_polling;
        config
    }

    pub fn seed_users(&self) -> impl Iterator<Item = UserRecord> + '_ {
        self.users.iter().map(|u| UserRecord {
            id: u.id.clone(),
            username: u.username.clone(),
            token_version: u.token_version,
        })
    }
}
