use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    /// Master nodes keep full transaction sets and request blocks without
    /// transaction payloads during catch-up.
    #[serde(default)]
    pub master: bool,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl NodeConfig {
    pub fn load(path: &Path) -> ChainResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| ChainError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> ChainResult<()> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            master: false,
            storage: StorageConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Number of consecutive blocks housed by a single shard database.
    #[serde(default = "default_max_blocks_per_db")]
    pub max_blocks_per_db: u64,
    /// Archival nodes refuse block and transaction removal.
    #[serde(default = "default_archival")]
    pub archival: bool,
    /// Compact (VACUUM) every shard database during startup.
    #[serde(default)]
    pub compact_on_start: bool,
}

fn default_max_blocks_per_db() -> u64 {
    1_000
}

fn default_archival() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_blocks_per_db: default_max_blocks_per_db(),
            archival: default_archival(),
            compact_on_start: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Receive timeout applied to peer sockets, in seconds.
    #[serde(default = "default_receive_timeout_secs")]
    pub receive_timeout_secs: u64,
}

fn default_receive_timeout_secs() -> u64 {
    5
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            receive_timeout_secs: default_receive_timeout_secs(),
        }
    }
}
