//! Store error types

use std::io;

use thiserror::Error;

use lattice_common::{BackupId, PartitionId, QueueId};

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Partition {0} is not hosted by this store")]
    PartitionNotFound(PartitionId),

    #[error("Queue {0} is out of range")]
    InvalidQueue(QueueId),

    #[error("Queue {0} is closed")]
    QueueClosed(QueueId),

    #[error("Backup {backup_id} of partition {partition_id} not found")]
    BackupNotFound {
        partition_id: PartitionId,
        backup_id: BackupId,
    },

    #[error("Backup {backup_id} of partition {partition_id} is corrupt: {reason}")]
    BackupCorrupt {
        partition_id: PartitionId,
        backup_id: BackupId,
        reason: String,
    },

    #[error("Writer agent is not accepting batches: {0}")]
    NotAccepting(String),

    #[error(transparent)]
    Rpc(#[from] lattice_common::Error),
}
