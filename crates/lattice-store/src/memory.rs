//! In-memory storage engine.
//!
//! Keeps every applied operation per partition together with the offset
//! applied so far for each queue, so redelivered batches become no-ops.
//! Backups are serialized partition images kept in a numbered catalog.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use lattice_common::{
    BackupId, MetaService, Offset, OperationBatch, OperationKind, PartitionId, QueueId,
    SnapshotId, StoreDataBatch, StoreId, BROADCAST_PARTITION_ID,
};

use crate::error::{Result, StoreError};
use crate::service::{GraphPartition, PartitionBackupEngine, StoreService};

/// Name of the partition image written by a restore.
pub const RESTORE_FILE_NAME: &str = "data.json";

/// An operation as persisted by the in-memory engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOperation {
    pub snapshot_id: SnapshotId,
    pub queue_id: QueueId,
    pub offset: Offset,
    pub kind: OperationKind,
    pub partition_key: Option<u64>,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PartitionData {
    applied_offsets: BTreeMap<QueueId, Offset>,
    operations: Vec<StoredOperation>,
}

impl PartitionData {
    /// Returns false when the batch's offset was already applied.
    fn apply(&mut self, batch: &StoreDataBatch, operations: &OperationBatch) -> bool {
        let applied = self.applied_offsets.entry(batch.queue_id).or_insert(0);
        if batch.offset <= *applied {
            return false;
        }
        *applied = batch.offset;
        self.operations.extend(
            operations
                .operations()
                .iter()
                .filter(|op| !op.kind.is_marker())
                .map(|op| StoredOperation {
                    snapshot_id: batch.snapshot_id,
                    queue_id: batch.queue_id,
                    offset: batch.offset,
                    kind: op.kind,
                    partition_key: op.partition_key,
                    payload: op.payload.clone(),
                }),
        );
        true
    }
}

#[derive(Debug, Clone)]
struct PartitionBackup {
    created_at: DateTime<Utc>,
    content: Vec<u8>,
    checksum: String,
}

fn checksum(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

#[derive(Debug)]
struct PartitionInner {
    partition_id: PartitionId,
    data: RwLock<PartitionData>,
    backups: Mutex<BTreeMap<BackupId, PartitionBackup>>,
    next_backup_id: Mutex<BackupId>,
}

/// One in-memory graph partition. Clones share state.
#[derive(Debug, Clone)]
pub struct MemoryPartition {
    inner: Arc<PartitionInner>,
}

impl MemoryPartition {
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            inner: Arc::new(PartitionInner {
                partition_id,
                data: RwLock::new(PartitionData::default()),
                backups: Mutex::new(BTreeMap::new()),
                next_backup_id: Mutex::new(1),
            }),
        }
    }

    pub fn operations(&self) -> Vec<StoredOperation> {
        self.inner.data.read().operations.clone()
    }

    pub fn applied_offset(&self, queue_id: QueueId) -> Offset {
        self.inner
            .data
            .read()
            .applied_offsets
            .get(&queue_id)
            .copied()
            .unwrap_or(0)
    }

    /// Ids of the backups currently in the catalog, ascending.
    pub fn backup_ids(&self) -> Vec<BackupId> {
        self.inner.backups.lock().keys().copied().collect()
    }

    pub fn backup_created_at(&self, backup_id: BackupId) -> Option<DateTime<Utc>> {
        self.inner.backups.lock().get(&backup_id).map(|b| b.created_at)
    }

    fn apply(&self, batch: &StoreDataBatch, operations: &OperationBatch) -> bool {
        self.inner.data.write().apply(batch, operations)
    }
}

impl GraphPartition for MemoryPartition {
    fn partition_id(&self) -> PartitionId {
        self.inner.partition_id
    }

    fn open_backup_engine(&self) -> Result<Box<dyn PartitionBackupEngine>> {
        Ok(Box::new(MemoryBackupEngine {
            partition: self.clone(),
        }))
    }
}

struct MemoryBackupEngine {
    partition: MemoryPartition,
}

impl MemoryBackupEngine {
    fn partition_id(&self) -> PartitionId {
        self.partition.inner.partition_id
    }

    fn load(&self, backup_id: BackupId) -> Result<PartitionBackup> {
        self.partition
            .inner
            .backups
            .lock()
            .get(&backup_id)
            .cloned()
            .ok_or(StoreError::BackupNotFound {
                partition_id: self.partition_id(),
                backup_id,
            })
    }

    fn check(&self, backup_id: BackupId, backup: &PartitionBackup) -> Result<()> {
        let corrupt = |reason: String| StoreError::BackupCorrupt {
            partition_id: self.partition_id(),
            backup_id,
            reason,
        };
        let actual = checksum(&backup.content);
        if actual != backup.checksum {
            return Err(corrupt(format!(
                "checksum mismatch: expected {}, got {}",
                backup.checksum, actual
            )));
        }
        serde_json::from_slice::<PartitionData>(&backup.content)
            .map_err(|e| corrupt(e.to_string()))?;
        Ok(())
    }
}

impl PartitionBackupEngine for MemoryBackupEngine {
    fn create_new_partition_backup(&self) -> Result<BackupId> {
        let content = serde_json::to_vec(&*self.partition.inner.data.read())?;
        let backup = PartitionBackup {
            created_at: Utc::now(),
            checksum: checksum(&content),
            content,
        };

        let backup_id = {
            let mut next = self.partition.inner.next_backup_id.lock();
            let id = *next;
            *next += 1;
            id
        };
        self.partition.inner.backups.lock().insert(backup_id, backup);
        debug!(partition_id = self.partition_id(), backup_id, "Created partition backup");
        Ok(backup_id)
    }

    fn verify_partition_backup(&self, backup_id: BackupId) -> Result<()> {
        let backup = self.load(backup_id)?;
        self.check(backup_id, &backup)
    }

    fn partition_backup_gc(&self, keep: &[BackupId]) -> Result<()> {
        let mut backups = self.partition.inner.backups.lock();
        let before = backups.len();
        backups.retain(|id, _| keep.contains(id));
        let removed = before - backups.len();
        if removed > 0 {
            info!(
                partition_id = self.partition_id(),
                removed, "Removed unavailable partition backups"
            );
        }
        Ok(())
    }

    fn restore_from_partition_backup(&self, backup_id: BackupId, restore_path: &Path) -> Result<()> {
        let backup = self.load(backup_id)?;
        self.check(backup_id, &backup)?;
        fs::create_dir_all(restore_path)?;
        fs::write(restore_path.join(RESTORE_FILE_NAME), &backup.content)?;
        info!(
            partition_id = self.partition_id(),
            backup_id,
            path = %restore_path.display(),
            "Restored partition backup"
        );
        Ok(())
    }
}

/// All partitions hosted by one storage node, plus the broadcast log.
pub struct MemoryStore {
    store_id: StoreId,
    partitions: BTreeMap<PartitionId, MemoryPartition>,
    broadcast: RwLock<PartitionData>,
}

impl MemoryStore {
    pub fn new(store_id: StoreId, partition_ids: impl IntoIterator<Item = PartitionId>) -> Self {
        let partitions = partition_ids
            .into_iter()
            .map(|pid| (pid, MemoryPartition::new(pid)))
            .collect();
        Self {
            store_id,
            partitions,
            broadcast: RwLock::new(PartitionData::default()),
        }
    }

    /// A store hosting the partitions `meta` assigns to `store_id`.
    pub fn for_store(store_id: StoreId, meta: &dyn MetaService) -> Self {
        Self::new(store_id, meta.partitions_for_store(store_id))
    }

    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    pub fn partition(&self, partition_id: PartitionId) -> Option<MemoryPartition> {
        self.partitions.get(&partition_id).cloned()
    }

    pub fn partition_ids(&self) -> Vec<PartitionId> {
        self.partitions.keys().copied().collect()
    }

    /// Broadcast operations (DDL) applied to this store, in apply order.
    pub fn broadcast_operations(&self) -> Vec<StoredOperation> {
        self.broadcast.read().operations.clone()
    }
}

impl StoreService for MemoryStore {
    fn batch_write(&self, batch: &StoreDataBatch) -> Result<bool> {
        if let Some((pid, _)) = batch
            .partition_batches()
            .find(|(pid, _)| *pid != BROADCAST_PARTITION_ID && !self.partitions.contains_key(pid))
        {
            return Err(StoreError::PartitionNotFound(pid));
        }

        let mut applied = false;
        for (partition_id, operations) in batch.partition_batches() {
            applied |= if partition_id == BROADCAST_PARTITION_ID {
                self.broadcast.write().apply(batch, operations)
            } else {
                match self.partitions.get(&partition_id) {
                    Some(partition) => partition.apply(batch, operations),
                    None => false,
                }
            };
        }
        Ok(applied)
    }

    fn id_to_partition(&self) -> HashMap<PartitionId, Arc<dyn GraphPartition>> {
        self.partitions
            .iter()
            .map(|(pid, partition)| (*pid, Arc::new(partition.clone()) as Arc<dyn GraphPartition>))
            .collect()
    }
}
