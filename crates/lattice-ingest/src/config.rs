//! Ingest configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Pending ingest requests a queue holds before rejecting new ones
    #[serde(default = "default_queue_buffer_capacity")]
    pub queue_buffer_capacity: usize,

    /// Batches coalesced into one store write
    #[serde(default = "default_send_batch_size")]
    pub send_batch_size: usize,

    #[serde(default = "default_send_retry_initial_ms")]
    pub send_retry_initial_ms: u64,

    #[serde(default = "default_send_retry_max_ms")]
    pub send_retry_max_ms: u64,

    /// Period of the ingest snapshot id advancer
    #[serde(default = "default_snapshot_increase_interval_ms")]
    pub snapshot_increase_interval_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_buffer_capacity: default_queue_buffer_capacity(),
            send_batch_size: default_send_batch_size(),
            send_retry_initial_ms: default_send_retry_initial_ms(),
            send_retry_max_ms: default_send_retry_max_ms(),
            snapshot_increase_interval_ms: default_snapshot_increase_interval_ms(),
        }
    }
}

impl IngestConfig {
    pub fn snapshot_increase_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_increase_interval_ms)
    }
}

fn default_queue_buffer_capacity() -> usize { 1024 }
fn default_send_batch_size() -> usize { 16 }
fn default_send_retry_initial_ms() -> u64 { 100 }
fn default_send_retry_max_ms() -> u64 { 5000 }
fn default_snapshot_increase_interval_ms() -> u64 { 1000 }
