//! Contracts of the native storage engine.
//!
//! Calls are synchronous; async callers run them on blocking threads.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use lattice_common::{BackupId, PartitionId, StoreDataBatch};

use crate::error::Result;

/// Local partitions of one storage node.
pub trait StoreService: Send + Sync {
    /// Apply every partition batch of `batch`. Redelivered batches (at or
    /// below the offset already applied for their queue) are no-ops.
    /// Returns whether anything was applied.
    fn batch_write(&self, batch: &StoreDataBatch) -> Result<bool>;

    fn id_to_partition(&self) -> HashMap<PartitionId, Arc<dyn GraphPartition>>;
}

pub trait GraphPartition: Send + Sync {
    fn partition_id(&self) -> PartitionId;

    fn open_backup_engine(&self) -> Result<Box<dyn PartitionBackupEngine>>;
}

/// Backup lifecycle of a single partition.
pub trait PartitionBackupEngine: Send {
    fn create_new_partition_backup(&self) -> Result<BackupId>;

    /// Check that the backup exists and is intact.
    fn verify_partition_backup(&self, backup_id: BackupId) -> Result<()>;

    /// Delete every backup not listed in `keep`.
    fn partition_backup_gc(&self, keep: &[BackupId]) -> Result<()>;

    fn restore_from_partition_backup(&self, backup_id: BackupId, restore_path: &Path) -> Result<()>;
}
