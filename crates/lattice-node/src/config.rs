//! Node configuration: every component's section in one document.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use validator::Validate;

use lattice_backup::BackupConfig;
use lattice_config::{ClusterConfig, ConfigLoader, EnvironmentProvider, FileProvider};
use lattice_ingest::IngestConfig;
use lattice_store::StoreConfig;
use lattice_wal::WalConfig;

/// Environment variable prefix; `LATTICE__STORE__COMMIT_INTERVAL_MS=500`
/// overrides `store.commit_interval_ms`.
pub const ENV_PREFIX: &str = "LATTICE";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub wal: WalConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub recycler: RecyclerConfig,
}

/// WAL truncation behind the offsets every store has committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecyclerConfig {
    #[serde(default = "default_recycler_enable")]
    pub enable: bool,

    #[serde(default = "default_recycler_interval_ms")]
    pub interval_ms: u64,
}

impl Default for RecyclerConfig {
    fn default() -> Self {
        Self {
            enable: default_recycler_enable(),
            interval_ms: default_recycler_interval_ms(),
        }
    }
}

impl RecyclerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

fn default_recycler_enable() -> bool {
    true
}

fn default_recycler_interval_ms() -> u64 {
    60_000
}

impl NodeConfig {
    /// Load from an optional file, then apply `LATTICE__*` overrides.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let mut loader = ConfigLoader::new();
        if let Some(path) = path {
            if !path.exists() {
                bail!("config file {} does not exist", path.display());
            }
            loader.add_provider(Box::new(FileProvider::new(path, 0)?));
        }
        loader.add_provider(Box::new(EnvironmentProvider::new(ENV_PREFIX, 100)));

        let config: NodeConfig = loader.load().await.context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.cluster
            .validate()
            .context("invalid cluster configuration")?;
        if self.ingest.queue_buffer_capacity == 0 {
            bail!("ingest.queue_buffer_capacity must be at least 1");
        }
        if self.wal.segment_size == 0 {
            bail!("wal.segment_size must be at least 1");
        }
        Ok(())
    }
}
