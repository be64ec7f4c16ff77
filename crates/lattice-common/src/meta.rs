//! Static cluster metadata: queue assignment and partition routing.

use crate::types::{PartitionId, QueueId, StoreId};

/// Read-only view of how queues, partitions and stores map onto each other.
pub trait MetaService: Send + Sync {
    fn queue_count(&self) -> u32;

    fn store_count(&self) -> u32;

    fn partition_count(&self) -> u32;

    /// Queues owned by the ingestor node with the given index.
    fn queue_ids_for_ingestor(&self, ingestor_index: u32) -> Vec<QueueId>;

    fn partition_for_key(&self, partition_key: u64) -> PartitionId;

    fn store_for_partition(&self, partition_id: PartitionId) -> StoreId;

    fn partitions_for_store(&self, store_id: StoreId) -> Vec<PartitionId>;
}

/// Modulo-based metadata derived from the cluster counts.
#[derive(Debug, Clone)]
pub struct StaticMetaService {
    store_count: u32,
    ingestor_count: u32,
    queue_count: u32,
    partition_count: u32,
}

impl StaticMetaService {
    /// All counts are clamped to at least one.
    pub fn new(store_count: u32, ingestor_count: u32, queue_count: u32, partition_count: u32) -> Self {
        Self {
            store_count: store_count.max(1),
            ingestor_count: ingestor_count.max(1),
            queue_count: queue_count.max(1),
            partition_count: partition_count.max(1),
        }
    }
}

impl MetaService for StaticMetaService {
    fn queue_count(&self) -> u32 {
        self.queue_count
    }

    fn store_count(&self) -> u32 {
        self.store_count
    }

    fn partition_count(&self) -> u32 {
        self.partition_count
    }

    fn queue_ids_for_ingestor(&self, ingestor_index: u32) -> Vec<QueueId> {
        (0..self.queue_count)
            .filter(|queue_id| queue_id % self.ingestor_count == ingestor_index)
            .collect()
    }

    fn partition_for_key(&self, partition_key: u64) -> PartitionId {
        (partition_key % u64::from(self.partition_count)) as PartitionId
    }

    fn store_for_partition(&self, partition_id: PartitionId) -> StoreId {
        partition_id.unsigned_abs() % self.store_count
    }

    fn partitions_for_store(&self, store_id: StoreId) -> Vec<PartitionId> {
        (0..self.partition_count)
            .filter(|pid| pid % self.store_count == store_id)
            .map(|pid| pid as PartitionId)
            .collect()
    }
}
