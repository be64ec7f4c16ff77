//! Coordinator and store RPC surface consumed by the write path.
//!
//! Transport is out of scope; these traits are the seam. In-process
//! implementations live next to the components that serve them.

use async_trait::async_trait;

use crate::batch::StoreDataBatch;
use crate::error::Result;
use crate::types::{Offset, QueueId, SnapshotId, StoreId};

/// Delivers data batches to the writer agent of one store.
#[async_trait]
pub trait StoreWriter: Send + Sync {
    /// Deliver `batches`, in order, to `store_id`. Success means the remote
    /// end accepted every batch; there is no partial acknowledgement.
    async fn write_store(&self, store_id: StoreId, batches: Vec<StoreDataBatch>) -> Result<()>;
}

/// Receives apply progress from storage nodes.
#[async_trait]
pub trait SnapshotCommitter: Send + Sync {
    /// Record that `store_id` has fully applied every snapshot up to and
    /// including `snapshot_id`. `queue_offsets` is indexed by queue id.
    async fn commit_snapshot_id(
        &self,
        store_id: StoreId,
        snapshot_id: SnapshotId,
        ddl_snapshot_id: SnapshotId,
        queue_offsets: Vec<Offset>,
    ) -> Result<()>;
}

/// Answers where WAL replay of a queue must resume.
#[async_trait]
pub trait IngestProgressFetcher: Send + Sync {
    /// Tail offsets, in the same order as `queue_ids`.
    async fn get_tail_offsets(&self, queue_ids: &[QueueId]) -> Result<Vec<Offset>>;
}
