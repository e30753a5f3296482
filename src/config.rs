//! Layered configuration: compiled defaults, then an optional TOML file,
//! then `GFS_`-prefixed environment variables (`GFS_CLIENT__MAX_ATTEMPTS=8`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::chunk::{ChunkGeometry, DEFAULT_CHUNK_SIZE};
use crate::common::ServerId;
use crate::error::{GfsError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub listen_addr: String,
    pub replication: usize,
    pub lease_duration_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub rpc_timeout_ms: u64,
    pub chunk_size: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            listen_addr: "127.0.0.1:7000".to_string(),
            replication: 3,
            lease_duration_ms: 60_000,
            heartbeat_timeout_ms: 30_000,
            rpc_timeout_ms: 5_000,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl MasterConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkserverConfig {
    /// Identity announced to the master. Defaults to `listen_addr`.
    pub id: Option<String>,
    pub listen_addr: String,
    pub master_addr: String,
    pub data_dir: PathBuf,
    pub chunk_size: u64,
    pub staging_capacity_bytes: u64,
    pub staging_idle_timeout_ms: u64,
    /// Staged entries younger than this are never evicted; a push that
    /// cannot make room otherwise is rejected.
    pub staging_eviction_grace_ms: u64,
    pub purge_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub reconnect_backoff_ms: u64,
    pub rpc_timeout_ms: u64,
    pub mutation_log_len: usize,
}

impl Default for ChunkserverConfig {
    fn default() -> Self {
        ChunkserverConfig {
            id: None,
            listen_addr: "127.0.0.1:7100".to_string(),
            master_addr: "127.0.0.1:7000".to_string(),
            data_dir: PathBuf::from("./data/chunkserver-0"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            staging_capacity_bytes: 64 * 1024 * 1024,
            staging_idle_timeout_ms: 60_000,
            staging_eviction_grace_ms: 1_000,
            purge_interval_ms: 5_000,
            heartbeat_interval_ms: 10_000,
            reconnect_backoff_ms: 1_000,
            rpc_timeout_ms: 5_000,
            mutation_log_len: 64,
        }
    }
}

impl ChunkserverConfig {
    pub fn server_id(&self) -> ServerId {
        ServerId::new(self.id.clone().unwrap_or_else(|| self.listen_addr.clone()))
    }

    pub fn geometry(&self) -> ChunkGeometry {
        ChunkGeometry::new(self.chunk_size)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub id: String,
    pub master_addr: String,
    pub chunk_size: u64,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub rpc_timeout_ms: u64,
    /// Network cost of reaching each chunkserver. Lower is closer; servers
    /// not listed sort last.
    pub proximity: HashMap<String, u32>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            id: "client-0".to_string(),
            master_addr: "127.0.0.1:7000".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_attempts: 5,
            retry_backoff_ms: 50,
            rpc_timeout_ms: 5_000,
            proximity: HashMap::new(),
        }
    }
}

impl ClientConfig {
    pub fn geometry(&self) -> ChunkGeometry {
        ChunkGeometry::new(self.chunk_size)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// `json` or `pretty`.
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        ObservabilityConfig { log_level: "info".to_string(), log_format: "pretty".to_string() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GfsConfig {
    pub master: MasterConfig,
    pub chunkserver: ChunkserverConfig,
    pub client: ClientConfig,
    pub observability: ObservabilityConfig,
}

impl GfsConfig {
    pub fn load(path: Option<&Path>) -> Result<GfsConfig> {
        let mut figment = Figment::from(Serialized::defaults(GfsConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file_exact(path));
        }
        figment
            .merge(Env::prefixed("GFS_").split("__"))
            .extract()
            .map_err(|e| GfsError::Config(e.to_string()))
    }
}
