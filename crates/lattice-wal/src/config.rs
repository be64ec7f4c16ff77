//! WAL configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Directory for WAL files, one sub-directory per queue
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Segment size in bytes before rotating to a new segment file
    #[serde(default = "default_segment_size")]
    pub segment_size: u64,

    /// Sync file data after every append
    #[serde(default = "default_fsync")]
    pub fsync: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            segment_size: default_segment_size(),
            fsync: default_fsync(),
        }
    }
}

fn default_data_dir() -> PathBuf { PathBuf::from("./data/wal") }
fn default_segment_size() -> u64 { 64 * 1024 * 1024 } // 64MB
fn default_fsync() -> bool { true }
