//! Ingest error types

use thiserror::Error;

use lattice_common::{QueueId, SnapshotId};
use lattice_wal::WalError;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// Log failure; fatal to the processor of the queue.
    #[error("WAL error on queue {queue_id}: {source}")]
    Wal {
        queue_id: QueueId,
        #[source]
        source: WalError,
    },

    #[error("Ingest buffer of queue {0} is full")]
    BufferFull(QueueId),

    #[error("Queue {0} is not available on this ingestor")]
    QueueNotAvailable(QueueId),

    #[error("Tail offset of queue {0} was not set before start")]
    TailOffsetNotSet(QueueId),

    #[error("Processor for queue {0} is not started")]
    NotStarted(QueueId),

    #[error("Processor for queue {0} is stopped")]
    Stopped(QueueId),

    #[error("Processor for queue {0} halted after a log failure")]
    Failed(QueueId),

    #[error("Snapshot id {requested} is not greater than current {current}")]
    SnapshotNotIncreasing {
        current: SnapshotId,
        requested: SnapshotId,
    },

    #[error("Ingest service is stopped")]
    ServiceStopped,

    #[error("Batch sender is shut down")]
    SenderClosed,

    #[error(transparent)]
    Rpc(#[from] lattice_common::Error),
}
