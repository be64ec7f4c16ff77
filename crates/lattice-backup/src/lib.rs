//! Store-wide backup and restore for lattice storage nodes.
//!
//! A storage node hosts several partitions, each with its own backup
//! engine. This crate treats them as one: every operation fans out to all
//! partitions on a bounded worker pool and completes once, with either the
//! aggregated result or the first partition failure.

pub mod agent;
pub mod config;

pub use agent::BackupAgent;
pub use config::BackupConfig;

use lattice_common::PartitionId;
use lattice_store::StoreError;
use thiserror::Error;

/// Backup error types
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Backup is disabled on this node")]
    Disabled,

    #[error("Partition {0} is not hosted by this store")]
    PartitionNotFound(PartitionId),

    #[error("Partition {partition_id} backup operation failed: {source}")]
    Partition {
        partition_id: PartitionId,
        #[source]
        source: StoreError,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BackupError {
    /// Partition the failure originated from, if any.
    pub fn partition_id(&self) -> Option<PartitionId> {
        match self {
            BackupError::PartitionNotFound(pid) => Some(*pid),
            BackupError::Partition { partition_id, .. } => Some(*partition_id),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
