//! Identifier types used throughout lattice.

/// Logical WAL shard identifier, in `[0, queue_count)`.
pub type QueueId = u32;

/// Storage node identifier, in `[0, store_count)`.
pub type StoreId = u32;

/// Graph partition identifier.
pub type PartitionId = i32;

/// Global, monotonic version counter defining point-in-time visibility.
pub type SnapshotId = u64;

/// Position of a record inside a queue's WAL. The first record of a queue is
/// at offset 1, so offset 0 means "nothing written/consumed yet".
pub type Offset = u64;

/// Backup identifier, both global and per partition.
pub type BackupId = i32;

/// Partition id under which broadcast operations (markers, DDL) are carried
/// inside a `StoreDataBatch`. Every store receives them.
pub const BROADCAST_PARTITION_ID: PartitionId = -1;
