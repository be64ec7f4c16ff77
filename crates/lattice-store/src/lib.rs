//! Storage-node side of the lattice write path.
//!
//! Batches arrive per queue through [`WriterAgent::write_store`], are merged
//! into one snapshot-ordered stream by the [`SnapshotSortQueue`] and applied
//! to local partitions through the [`StoreService`] contract. Apply progress
//! is committed periodically through a `SnapshotCommitter`.

pub mod config;
pub mod error;
pub mod local;
pub mod memory;
pub mod progress;
pub mod service;
pub mod sort_queue;
pub mod writer;

pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use local::LocalStoreWriter;
pub use memory::{MemoryPartition, MemoryStore, StoredOperation, RESTORE_FILE_NAME};
pub use progress::{CommitTracker, StoreCommit};
pub use service::{GraphPartition, PartitionBackupEngine, StoreService};
pub use sort_queue::SnapshotSortQueue;
pub use writer::{AvailableSnapshot, WriterAgent};
