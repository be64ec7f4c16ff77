//! Store configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Period between snapshot commits to the coordinator
    #[serde(default = "default_commit_interval_ms")]
    pub commit_interval_ms: u64,

    /// How long the apply loop waits on the sort queue before re-checking
    /// for shutdown
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            commit_interval_ms: default_commit_interval_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms.max(1))
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms.max(1))
    }
}

fn default_commit_interval_ms() -> u64 { 1000 }
fn default_poll_timeout_ms() -> u64 { 100 }
