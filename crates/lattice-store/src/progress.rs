//! In-process coordinator for store apply progress.
//!
//! Collects the snapshot commits of every store and answers the questions
//! the rest of the write path asks about them: which snapshot is readable
//! everywhere, and where WAL replay of a queue has to resume.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use lattice_common::{
    Error, IngestProgressFetcher, Offset, QueueId, SnapshotCommitter, SnapshotId, StoreId,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCommit {
    pub snapshot_id: SnapshotId,
    pub ddl_snapshot_id: SnapshotId,
    pub queue_offsets: Vec<Offset>,
}

pub struct CommitTracker {
    store_count: u32,
    commits: DashMap<StoreId, StoreCommit>,
}

impl CommitTracker {
    pub fn new(store_count: u32) -> Self {
        Self {
            store_count: store_count.max(1),
            commits: DashMap::new(),
        }
    }

    pub fn committed(&self, store_id: StoreId) -> Option<StoreCommit> {
        self.commits.get(&store_id).map(|c| c.value().clone())
    }

    fn all_committed(&self) -> bool {
        self.commits.len() as u32 >= self.store_count
    }

    /// Snapshot fully applied on every store; 0 until each has committed.
    pub fn query_snapshot_id(&self) -> SnapshotId {
        if !self.all_committed() {
            return 0;
        }
        self.commits
            .iter()
            .map(|c| c.snapshot_id)
            .min()
            .unwrap_or(0)
    }

    /// Highest offset of `queue_id` consumed by every store.
    pub fn tail_offset(&self, queue_id: QueueId) -> Offset {
        if !self.all_committed() {
            return 0;
        }
        self.commits
            .iter()
            .map(|c| c.queue_offsets.get(queue_id as usize).copied().unwrap_or(0))
            .min()
            .unwrap_or(0)
    }
}

#[async_trait]
impl SnapshotCommitter for CommitTracker {
    async fn commit_snapshot_id(
        &self,
        store_id: StoreId,
        snapshot_id: SnapshotId,
        ddl_snapshot_id: SnapshotId,
        queue_offsets: Vec<Offset>,
    ) -> lattice_common::Result<()> {
        if store_id >= self.store_count {
            return Err(Error::InvalidInput(format!("unknown store {}", store_id)));
        }

        let mut entry = self.commits.entry(store_id).or_insert_with(|| StoreCommit {
            snapshot_id: 0,
            ddl_snapshot_id: 0,
            queue_offsets: Vec::new(),
        });
        if snapshot_id < entry.snapshot_id {
            warn!(
                store_id,
                snapshot_id,
                committed = entry.snapshot_id,
                "Ignoring stale snapshot commit"
            );
            return Ok(());
        }

        entry.snapshot_id = snapshot_id;
        entry.ddl_snapshot_id = entry.ddl_snapshot_id.max(ddl_snapshot_id);
        if entry.queue_offsets.len() < queue_offsets.len() {
            entry.queue_offsets.resize(queue_offsets.len(), 0);
        }
        for (committed, offset) in entry.queue_offsets.iter_mut().zip(queue_offsets) {
            *committed = (*committed).max(offset);
        }
        debug!(store_id, snapshot_id, ddl_snapshot_id, "Store committed snapshot");
        Ok(())
    }
}

#[async_trait]
impl IngestProgressFetcher for CommitTracker {
    async fn get_tail_offsets(&self, queue_ids: &[QueueId]) -> lattice_common::Result<Vec<Offset>> {
        Ok(queue_ids.iter().map(|q| self.tail_offset(*q)).collect())
    }
}
