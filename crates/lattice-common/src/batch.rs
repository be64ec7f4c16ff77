//! Write path data model: operations, batches and backup identifiers.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::{
    BackupId, Offset, PartitionId, QueueId, SnapshotId, BROADCAST_PARTITION_ID,
};

/// Kind of a single encoded mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Synchronization token closing a snapshot epoch. Never applied to storage.
    Marker,
    OverwriteVertex,
    UpdateVertex,
    DeleteVertex,
    OverwriteEdge,
    UpdateEdge,
    DeleteEdge,
    /// Schema change carried on the data path.
    Ddl,
}

impl OperationKind {
    pub fn is_marker(self) -> bool {
        matches!(self, OperationKind::Marker)
    }

    pub fn is_ddl(self) -> bool {
        matches!(self, OperationKind::Ddl)
    }
}

/// One encoded mutation.
///
/// Operations without a partition key (markers, DDL) are broadcast to every
/// store; keyed operations are routed to the partition owning the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationBlob {
    pub kind: OperationKind,
    pub partition_key: Option<u64>,
    pub payload: Bytes,
}

/// Sentinel operation used purely as a barrier token.
pub const MARKER_OPERATION_BLOB: OperationBlob = OperationBlob {
    kind: OperationKind::Marker,
    partition_key: None,
    payload: Bytes::new(),
};

impl OperationBlob {
    pub fn new(kind: OperationKind, partition_key: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            partition_key: Some(partition_key),
            payload: payload.into(),
        }
    }

    pub fn ddl(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: OperationKind::Ddl,
            partition_key: None,
            payload: payload.into(),
        }
    }

    /// Whether every store must see this operation.
    pub fn is_broadcast(&self) -> bool {
        self.partition_key.is_none()
    }
}

/// Ordered, immutable sequence of operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationBatch {
    operations: Vec<OperationBlob>,
}

impl OperationBatch {
    pub fn new(operations: Vec<OperationBlob>) -> Self {
        Self { operations }
    }

    /// The barrier batch injected into every queue when the ingest snapshot
    /// id advances.
    pub fn marker() -> Self {
        Self {
            operations: vec![MARKER_OPERATION_BLOB],
        }
    }

    pub fn operations(&self) -> &[OperationBlob] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// True when the batch only carries marker operations.
    pub fn is_marker(&self) -> bool {
        !self.operations.is_empty() && self.operations.iter().all(|op| op.kind.is_marker())
    }

    pub fn has_ddl(&self) -> bool {
        self.operations.iter().any(|op| op.kind.is_ddl())
    }

    /// Split the batch per destination partition, preserving the relative
    /// order of operations inside each partition. Broadcast operations land
    /// under [`BROADCAST_PARTITION_ID`].
    pub fn split_by_partition<F>(&self, partition_of: F) -> BTreeMap<PartitionId, OperationBatch>
    where
        F: Fn(u64) -> PartitionId,
    {
        let mut split: BTreeMap<PartitionId, Vec<OperationBlob>> = BTreeMap::new();
        for op in &self.operations {
            let partition_id = match op.partition_key {
                Some(key) => partition_of(key),
                None => BROADCAST_PARTITION_ID,
            };
            split.entry(partition_id).or_default().push(op.clone());
        }
        split
            .into_iter()
            .map(|(partition_id, ops)| (partition_id, OperationBatch::new(ops)))
            .collect()
    }
}

impl FromIterator<OperationBlob> for OperationBatch {
    fn from_iter<I: IntoIterator<Item = OperationBlob>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// A durable WAL record as seen by a reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadLogEntry {
    pub offset: Offset,
    pub snapshot_id: SnapshotId,
    pub batch: OperationBatch,
}

/// Unit of delivery from ingestors to storage nodes.
///
/// One `StoreDataBatch` is produced per queue per WAL record (and per
/// destination store); `data` fans that record out to the partitions it
/// touches on the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDataBatch {
    pub request_id: String,
    pub queue_id: QueueId,
    pub snapshot_id: SnapshotId,
    pub offset: Offset,
    pub data: Vec<BTreeMap<PartitionId, OperationBatch>>,
}

impl StoreDataBatch {
    pub fn new(
        request_id: impl Into<String>,
        queue_id: QueueId,
        snapshot_id: SnapshotId,
        offset: Offset,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            queue_id,
            snapshot_id,
            offset,
            data: Vec::new(),
        }
    }

    pub fn with_partition_batches(
        mut self,
        partition_batches: BTreeMap<PartitionId, OperationBatch>,
    ) -> Self {
        self.data.push(partition_batches);
        self
    }

    /// All partition batches in delivery order.
    pub fn partition_batches(&self) -> impl Iterator<Item = (PartitionId, &OperationBatch)> {
        self.data
            .iter()
            .flat_map(|entry| entry.iter().map(|(pid, batch)| (*pid, batch)))
    }

    pub fn operation_count(&self) -> usize {
        self.partition_batches().map(|(_, batch)| batch.len()).sum()
    }

    pub fn has_ddl(&self) -> bool {
        self.partition_batches().any(|(_, batch)| batch.has_ddl())
    }

    /// True when the batch only carries barrier markers.
    pub fn is_marker(&self) -> bool {
        let mut any = false;
        for (_, batch) in self.partition_batches() {
            if !batch.is_marker() {
                return false;
            }
            any = true;
        }
        any
    }
}

/// Cluster-wide backup identifier: one local backup id per partition, grouped
/// under a global backup id. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreBackupId {
    global_backup_id: BackupId,
    partition_backup_ids: BTreeMap<PartitionId, BackupId>,
}

impl StoreBackupId {
    pub fn new(
        global_backup_id: BackupId,
        partition_backup_ids: BTreeMap<PartitionId, BackupId>,
    ) -> Self {
        Self {
            global_backup_id,
            partition_backup_ids,
        }
    }

    pub fn global_backup_id(&self) -> BackupId {
        self.global_backup_id
    }

    pub fn partition_backup_ids(&self) -> &BTreeMap<PartitionId, BackupId> {
        &self.partition_backup_ids
    }

    pub fn partition_backup_id(&self, partition_id: PartitionId) -> Option<BackupId> {
        self.partition_backup_ids.get(&partition_id).copied()
    }
}
