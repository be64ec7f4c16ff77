//! Common types and collaborator contracts shared across lattice components.
//!
//! The write path is assembled from small, narrowly-scoped collaborators:
//! the data model in [`batch`], cluster metadata in [`meta`], membership in
//! [`membership`] and the coordinator/store RPC surface in [`rpc`].

pub mod batch;
pub mod error;
pub mod membership;
pub mod meta;
pub mod rpc;
pub mod types;

pub use batch::{
    OperationBatch, OperationBlob, OperationKind, ReadLogEntry, StoreBackupId, StoreDataBatch,
    MARKER_OPERATION_BLOB,
};
pub use error::{Error, Result};
pub use membership::{LocalDiscovery, MembershipEvent, NodeDiscovery, NodeInfo, NodeRole};
pub use meta::{MetaService, StaticMetaService};
pub use rpc::{IngestProgressFetcher, SnapshotCommitter, StoreWriter};
pub use types::{
    BackupId, Offset, PartitionId, QueueId, SnapshotId, StoreId, BROADCAST_PARTITION_ID,
};

/// Re-export commonly used external types
pub use bytes::Bytes;
