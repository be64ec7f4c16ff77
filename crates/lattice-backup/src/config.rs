//! Backup configuration

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Whether this node serves backup requests
    #[serde(default)]
    pub enable: bool,

    /// Number of partition backup operations run in parallel
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enable: false,
            thread_count: default_thread_count(),
        }
    }
}

fn default_thread_count() -> usize {
    1
}
