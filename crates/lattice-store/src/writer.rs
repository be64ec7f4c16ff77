//! Writer agent: applies the merged batch stream and commits progress.
//!
//! Batches handed to [`WriterAgent::write_store`] go through the
//! [`SnapshotSortQueue`]; a dedicated apply thread drains it into the
//! [`StoreService`]. When the first batch of a new snapshot is seen, every
//! batch of the previous snapshots has already been applied, so the
//! snapshot just below it becomes available. A periodic task commits the
//! available snapshot and the consumed queue offsets.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use lattice_common::{Offset, SnapshotCommitter, SnapshotId, StoreDataBatch, StoreId};

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::service::StoreService;
use crate::sort_queue::SnapshotSortQueue;

/// Latest snapshot whose batches are all applied, with the DDL snapshot
/// that was current at that point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AvailableSnapshot {
    pub snapshot_id: SnapshotId,
    pub ddl_snapshot_id: SnapshotId,
}

#[derive(Debug)]
struct ApplyProgress {
    consume_snapshot_id: SnapshotId,
    consume_ddl_snapshot_id: SnapshotId,
    available: AvailableSnapshot,
    queue_offsets: Vec<Offset>,
}

impl ApplyProgress {
    fn recovered(snapshot_id: SnapshotId, queue_count: usize) -> Self {
        Self {
            consume_snapshot_id: snapshot_id,
            consume_ddl_snapshot_id: snapshot_id,
            available: AvailableSnapshot {
                snapshot_id,
                ddl_snapshot_id: snapshot_id,
            },
            queue_offsets: vec![0; queue_count],
        }
    }
}

/// State shared by the agent handle, the apply thread and the commit task.
struct AgentShared {
    store_id: StoreId,
    store: Arc<dyn StoreService>,
    committer: Arc<dyn SnapshotCommitter>,
    sort_queue: SnapshotSortQueue,
    progress: Mutex<ApplyProgress>,
    last_committed: AtomicU64,
    commit_lock: tokio::sync::Mutex<()>,
    stopped: AtomicBool,
    failed: AtomicBool,
}

pub struct WriterAgent {
    shared: Arc<AgentShared>,
    config: StoreConfig,
    cancel: CancellationToken,
    apply_thread: Mutex<Option<thread::JoinHandle<()>>>,
    commit_task: Mutex<Option<JoinHandle<()>>>,
}

impl WriterAgent {
    pub fn new(
        store_id: StoreId,
        queue_count: usize,
        config: StoreConfig,
        store: Arc<dyn StoreService>,
        committer: Arc<dyn SnapshotCommitter>,
    ) -> Self {
        let queue_count = queue_count.max(1);
        Self {
            shared: Arc::new(AgentShared {
                store_id,
                store,
                committer,
                sort_queue: SnapshotSortQueue::new(queue_count),
                progress: Mutex::new(ApplyProgress::recovered(0, queue_count)),
                last_committed: AtomicU64::new(0),
                commit_lock: tokio::sync::Mutex::new(()),
                stopped: AtomicBool::new(false),
                failed: AtomicBool::new(false),
            }),
            config,
            cancel: CancellationToken::new(),
            apply_thread: Mutex::new(None),
            commit_task: Mutex::new(None),
        }
    }

    pub fn store_id(&self) -> StoreId {
        self.shared.store_id
    }

    /// Reset progress to the snapshot the storage engine recovered to.
    /// Call before [`start`](Self::start).
    pub fn init(&self, recovered_snapshot_id: SnapshotId) {
        let queue_count = self.shared.sort_queue.queue_count();
        *self.shared.progress.lock() = ApplyProgress::recovered(recovered_snapshot_id, queue_count);
        self.shared
            .last_committed
            .store(recovered_snapshot_id, Ordering::SeqCst);
        info!(
            store_id = self.shared.store_id,
            recovered_snapshot_id, "Writer agent initialized"
        );
    }

    /// Spawn the apply thread and the commit task. Must be called inside a
    /// tokio runtime. Starting twice is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut apply_thread = self.apply_thread.lock();
        if apply_thread.is_some() {
            return Ok(());
        }
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(StoreError::NotAccepting("agent is stopped".to_string()));
        }

        let shared = self.shared.clone();
        let poll_timeout = self.config.poll_timeout();
        let handle = thread::Builder::new()
            .name(format!("store-{}-apply", self.shared.store_id))
            .spawn(move || shared.apply_loop(poll_timeout))?;
        *apply_thread = Some(handle);

        let shared = self.shared.clone();
        let period = self.config.commit_interval();
        let cancel = self.cancel.clone();
        *self.commit_task.lock() = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = shared.try_commit().await {
                            warn!(store_id = shared.store_id, "Snapshot commit failed, retrying next tick: {}", e);
                        }
                    }
                }
            }
        }));

        info!(
            store_id = self.shared.store_id,
            commit_interval_ms = self.config.commit_interval_ms,
            "Writer agent started"
        );
        Ok(())
    }

    /// Accept a batch for apply. Returns once the batch is queued.
    pub fn write_store(&self, batch: StoreDataBatch) -> Result<()> {
        if self.shared.failed.load(Ordering::SeqCst) {
            return Err(StoreError::NotAccepting("apply loop failed".to_string()));
        }
        self.shared.sort_queue.offer_queue(batch.queue_id, batch)
    }

    /// Commit the available snapshot now if it moved since the last commit.
    /// Returns whether a commit was made.
    pub async fn try_commit(&self) -> Result<bool> {
        self.shared.try_commit().await
    }

    pub fn available_snapshot(&self) -> AvailableSnapshot {
        self.shared.progress.lock().available
    }

    pub fn last_committed_snapshot_id(&self) -> SnapshotId {
        self.shared.last_committed.load(Ordering::SeqCst)
    }

    /// Offsets consumed so far, indexed by queue id.
    pub fn queue_offsets(&self) -> Vec<Offset> {
        self.shared.progress.lock().queue_offsets.clone()
    }

    pub fn is_failed(&self) -> bool {
        self.shared.failed.load(Ordering::SeqCst)
    }

    /// Stop applying and committing. Batches still buffered are dropped;
    /// they are redelivered from the WAL. Idempotent.
    pub async fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.sort_queue.close();
        self.cancel.cancel();

        let commit_task = self.commit_task.lock().take();
        if let Some(task) = commit_task {
            let _ = task.await;
        }

        let apply_thread = self.apply_thread.lock().take();
        if let Some(handle) = apply_thread {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(())) => {}
                _ => warn!(store_id = self.shared.store_id, "Apply thread did not exit cleanly"),
            }
            info!(store_id = self.shared.store_id, "Writer agent stopped");
        }
    }
}

impl AgentShared {
    fn apply_loop(&self, poll_timeout: std::time::Duration) {
        debug!(store_id = self.store_id, "Apply loop running");
        while !self.stopped.load(Ordering::SeqCst) {
            let Some(batch) = self.sort_queue.poll_timeout(poll_timeout) else {
                continue;
            };
            if let Err(e) = self.apply(batch) {
                error!(store_id = self.store_id, "Apply failed, writer agent halted: {}", e);
                self.failed.store(true, Ordering::SeqCst);
                break;
            }
        }
        debug!(store_id = self.store_id, "Apply loop exited");
    }

    fn apply(&self, batch: StoreDataBatch) -> Result<()> {
        let queue_idx = batch.queue_id as usize;
        {
            let mut progress = self.progress.lock();
            let Some(consumed) = progress.queue_offsets.get(queue_idx).copied() else {
                return Err(StoreError::InvalidQueue(batch.queue_id));
            };
            if batch.offset <= consumed {
                debug!(
                    queue_id = batch.queue_id,
                    offset = batch.offset,
                    consumed,
                    "Skipping redelivered batch"
                );
                return Ok(());
            }
            if batch.snapshot_id > progress.consume_snapshot_id {
                progress.available = AvailableSnapshot {
                    snapshot_id: batch.snapshot_id - 1,
                    ddl_snapshot_id: progress.consume_ddl_snapshot_id,
                };
                progress.consume_snapshot_id = batch.snapshot_id;
            }
        }

        let has_ddl = batch.has_ddl();
        self.store.batch_write(&batch)?;

        let mut progress = self.progress.lock();
        if has_ddl {
            progress.consume_ddl_snapshot_id = batch.snapshot_id;
        }
        progress.queue_offsets[queue_idx] = batch.offset;
        Ok(())
    }

    async fn try_commit(&self) -> Result<bool> {
        let _guard = self.commit_lock.lock().await;
        let (available, queue_offsets) = {
            let progress = self.progress.lock();
            (progress.available, progress.queue_offsets.clone())
        };
        if available.snapshot_id <= self.last_committed.load(Ordering::SeqCst) {
            return Ok(false);
        }

        self.committer
            .commit_snapshot_id(
                self.store_id,
                available.snapshot_id,
                available.ddl_snapshot_id,
                queue_offsets,
            )
            .await?;
        self.last_committed
            .store(available.snapshot_id, Ordering::SeqCst);
        debug!(
            store_id = self.store_id,
            snapshot_id = available.snapshot_id,
            ddl_snapshot_id = available.ddl_snapshot_id,
            "Committed snapshot"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use lattice_common::{OperationBatch, OperationBlob, OperationKind, PartitionId};

    use crate::service::GraphPartition;

    #[derive(Default)]
    struct RecordingStore {
        writes: Mutex<Vec<(u32, SnapshotId, Offset)>>,
        fail: AtomicBool,
    }

    impl StoreService for RecordingStore {
        fn batch_write(&self, batch: &StoreDataBatch) -> Result<bool> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::PartitionNotFound(9));
            }
            self.writes
                .lock()
                .push((batch.queue_id, batch.snapshot_id, batch.offset));
            Ok(true)
        }

        fn id_to_partition(&self) -> HashMap<PartitionId, Arc<dyn GraphPartition>> {
            HashMap::new()
        }
    }

    #[derive(Default)]
    struct RecordingCommitter {
        commits: Mutex<Vec<(StoreId, SnapshotId, SnapshotId, Vec<Offset>)>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl SnapshotCommitter for RecordingCommitter {
        async fn commit_snapshot_id(
            &self,
            store_id: StoreId,
            snapshot_id: SnapshotId,
            ddl_snapshot_id: SnapshotId,
            queue_offsets: Vec<Offset>,
        ) -> lattice_common::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(lattice_common::Error::Rpc("coordinator down".to_string()));
            }
            self.commits
                .lock()
                .push((store_id, snapshot_id, ddl_snapshot_id, queue_offsets));
            Ok(())
        }
    }

    fn agent(
        queue_count: usize,
        store: Arc<RecordingStore>,
        committer: Arc<RecordingCommitter>,
    ) -> WriterAgent {
        let config = StoreConfig {
            commit_interval_ms: 3_600_000,
            poll_timeout_ms: 10,
        };
        WriterAgent::new(0, queue_count, config, store, committer)
    }

    fn data(queue_id: u32, snapshot_id: SnapshotId, offset: Offset) -> StoreDataBatch {
        let mut partitions = std::collections::BTreeMap::new();
        partitions.insert(
            0,
            OperationBatch::new(vec![OperationBlob::new(OperationKind::OverwriteVertex, 0, "v")]),
        );
        StoreDataBatch::new("req", queue_id, snapshot_id, offset).with_partition_batches(partitions)
    }

    fn ddl(queue_id: u32, snapshot_id: SnapshotId, offset: Offset) -> StoreDataBatch {
        let mut partitions = std::collections::BTreeMap::new();
        partitions.insert(
            lattice_common::BROADCAST_PARTITION_ID,
            OperationBatch::new(vec![OperationBlob::ddl("create label")]),
        );
        StoreDataBatch::new("ddl", queue_id, snapshot_id, offset).with_partition_batches(partitions)
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_commit_lags_one_snapshot_behind() {
        let store = Arc::new(RecordingStore::default());
        let committer = Arc::new(RecordingCommitter::default());
        let agent = agent(1, store.clone(), committer.clone());
        agent.init(0);
        agent.start().unwrap();

        agent.write_store(data(0, 2, 10)).unwrap();
        wait_for(|| agent.queue_offsets() == vec![10]).await;

        assert!(agent.try_commit().await.unwrap());
        assert_eq!(committer.commits.lock().clone(), vec![(0, 1, 0, vec![10])]);
        assert_eq!(agent.last_committed_snapshot_id(), 1);

        // Nothing new to commit.
        assert!(!agent.try_commit().await.unwrap());
        agent.stop().await;
    }

    #[tokio::test]
    async fn test_redelivery_is_skipped() {
        let store = Arc::new(RecordingStore::default());
        let committer = Arc::new(RecordingCommitter::default());
        let agent = agent(2, store.clone(), committer);
        agent.init(0);
        agent.start().unwrap();

        agent.write_store(data(0, 1, 1)).unwrap();
        agent.write_store(data(1, 1, 1)).unwrap();
        agent.write_store(data(0, 1, 1)).unwrap();
        agent.write_store(data(0, 1, 2)).unwrap();
        agent.write_store(data(1, 2, 2)).unwrap();
        agent.write_store(data(0, 2, 3)).unwrap();
        wait_for(|| agent.queue_offsets() == vec![3, 2]).await;

        let writes = store.writes.lock().clone();
        assert_eq!(writes.len(), 5);
        assert_eq!(agent.available_snapshot().snapshot_id, 1);
        agent.stop().await;
    }

    #[tokio::test]
    async fn test_ddl_snapshot_reported_after_next_snapshot() {
        let store = Arc::new(RecordingStore::default());
        let committer = Arc::new(RecordingCommitter::default());
        let agent = agent(1, store, committer.clone());
        agent.init(0);
        agent.start().unwrap();

        agent.write_store(ddl(0, 3, 1)).unwrap();
        agent.write_store(data(0, 4, 2)).unwrap();
        agent.write_store(data(0, 5, 3)).unwrap();
        wait_for(|| agent.queue_offsets() == vec![3]).await;

        assert_eq!(
            agent.available_snapshot(),
            AvailableSnapshot {
                snapshot_id: 4,
                ddl_snapshot_id: 3
            }
        );
        assert!(agent.try_commit().await.unwrap());
        assert_eq!(committer.commits.lock().clone(), vec![(0, 4, 3, vec![3])]);
        agent.stop().await;
    }

    #[tokio::test]
    async fn test_failed_commit_is_retried() {
        let store = Arc::new(RecordingStore::default());
        let committer = Arc::new(RecordingCommitter::default());
        let agent = agent(1, store, committer.clone());
        agent.init(5);
        agent.start().unwrap();
        assert_eq!(agent.available_snapshot().snapshot_id, 5);

        agent.write_store(data(0, 7, 1)).unwrap();
        wait_for(|| agent.queue_offsets() == vec![1]).await;

        committer.fail.store(true, Ordering::SeqCst);
        assert!(agent.try_commit().await.is_err());
        assert_eq!(agent.last_committed_snapshot_id(), 5);

        committer.fail.store(false, Ordering::SeqCst);
        assert!(agent.try_commit().await.unwrap());
        assert_eq!(committer.commits.lock().clone(), vec![(0, 6, 5, vec![1])]);
        agent.stop().await;
    }

    #[tokio::test]
    async fn test_apply_failure_halts_agent() {
        let store = Arc::new(RecordingStore::default());
        store.fail.store(true, Ordering::SeqCst);
        let agent = agent(1, store, Arc::new(RecordingCommitter::default()));
        agent.init(0);
        agent.start().unwrap();

        agent.write_store(data(0, 1, 1)).unwrap();
        wait_for(|| agent.is_failed()).await;
        assert!(matches!(
            agent.write_store(data(0, 1, 2)),
            Err(StoreError::NotAccepting(_))
        ));

        agent.stop().await;
        agent.stop().await;
        assert!(agent.write_store(data(0, 2, 3)).is_err());
    }
}
