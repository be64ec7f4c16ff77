//! Log service contract consumed by the ingest path.

use async_trait::async_trait;

use lattice_common::{OperationBatch, Offset, QueueId, ReadLogEntry, SnapshotId};

use crate::error::Result;

/// Factory for per-queue readers and writers.
#[async_trait]
pub trait LogService: Send + Sync {
    /// Open the single writer of `queue_id`. Appends continue after the last
    /// durable record.
    async fn create_writer(&self, queue_id: QueueId) -> Result<Box<dyn LogWriter>>;

    /// Open a reader positioned at the first record with offset `>= from_offset`.
    async fn create_reader(&self, queue_id: QueueId, from_offset: Offset)
        -> Result<Box<dyn LogReader>>;

    /// Drop records strictly below `offset` where the storage layout allows
    /// it. Returns how many storage units (segments, records) were removed.
    async fn delete_before(&self, queue_id: QueueId, offset: Offset) -> Result<usize>;
}

/// Appends records to one queue.
#[async_trait]
pub trait LogWriter: Send {
    /// Durably append a record and return the offset assigned to it.
    async fn append(&mut self, snapshot_id: SnapshotId, batch: &OperationBatch) -> Result<Offset>;

    /// Flush and release the writer. Closing twice is a no-op.
    async fn close(&mut self) -> Result<()>;
}

/// Sequential reader over one queue.
#[async_trait]
pub trait LogReader: Send {
    /// Next record in offset order, or `None` once the log is exhausted.
    async fn read_next(&mut self) -> Result<Option<ReadLogEntry>>;

    async fn close(&mut self) -> Result<()>;
}
