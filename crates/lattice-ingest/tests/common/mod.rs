//! Recording collaborators shared by the ingest integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use lattice_common::{
    IngestProgressFetcher, OperationBatch, OperationBlob, OperationKind, Offset, QueueId,
    SnapshotId, StoreDataBatch, StoreId, StoreWriter,
};
use lattice_ingest::{DataBatchSender, IngestError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRecord {
    pub request_id: String,
    pub queue_id: QueueId,
    pub snapshot_id: SnapshotId,
    pub offset: Offset,
    pub batch: OperationBatch,
}

/// Sender that records every hand-off. Sends can be held back with a gate.
pub struct RecordingSender {
    sent: Mutex<Vec<SentRecord>>,
    gate: Option<Semaphore>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    /// Every send waits for a permit released with [`open_gate`].
    pub fn gated() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            gate: Some(Semaphore::new(0)),
        }
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        self.sent.lock().clone()
    }

    pub fn sent_for(&self, queue_id: QueueId) -> Vec<SentRecord> {
        self.sent().into_iter().filter(|r| r.queue_id == queue_id).collect()
    }
}

#[async_trait]
impl DataBatchSender for RecordingSender {
    async fn async_send_with_retry(
        &self,
        request_id: &str,
        queue_id: QueueId,
        snapshot_id: SnapshotId,
        offset: Offset,
        batch: OperationBatch,
    ) -> Result<(), IngestError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.map_err(|_| IngestError::SenderClosed)?.forget();
        }
        self.sent.lock().push(SentRecord {
            request_id: request_id.to_string(),
            queue_id,
            snapshot_id,
            offset,
            batch,
        });
        Ok(())
    }
}

/// Progress fetcher answering the same tail for every queue. Answers can
/// be held back with a gate.
pub struct FixedProgress {
    tail: Offset,
    calls: AtomicUsize,
    gate: Option<Semaphore>,
}

impl FixedProgress {
    pub fn new(tail: Offset) -> Self {
        Self {
            tail,
            calls: AtomicUsize::new(0),
            gate: None,
        }
    }

    pub fn gated(tail: Offset) -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new(tail)
        }
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IngestProgressFetcher for FixedProgress {
    async fn get_tail_offsets(&self, queue_ids: &[QueueId]) -> lattice_common::Result<Vec<Offset>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| lattice_common::Error::Unavailable("progress gate closed".into()))?
                .forget();
        }
        Ok(vec![self.tail; queue_ids.len()])
    }
}

/// Store writer recording each `write_store` call; the first `failures`
/// calls are rejected.
pub struct RecordingStoreWriter {
    calls: Mutex<Vec<(StoreId, Vec<StoreDataBatch>)>>,
    failures: AtomicUsize,
}

impl RecordingStoreWriter {
    pub fn new() -> Self {
        Self::failing(0)
    }

    pub fn failing(failures: usize) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(failures),
        }
    }

    pub fn calls(&self) -> Vec<(StoreId, Vec<StoreDataBatch>)> {
        self.calls.lock().clone()
    }

    /// Batches acknowledged by `store_id`, in delivery order.
    pub fn delivered_to(&self, store_id: StoreId) -> Vec<StoreDataBatch> {
        self.calls
            .lock()
            .iter()
            .filter(|(id, _)| *id == store_id)
            .flat_map(|(_, batches)| batches.clone())
            .collect()
    }
}

#[async_trait]
impl StoreWriter for RecordingStoreWriter {
    async fn write_store(
        &self,
        store_id: StoreId,
        batches: Vec<StoreDataBatch>,
    ) -> lattice_common::Result<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(lattice_common::Error::Rpc(format!("store {} unreachable", store_id)));
        }
        self.calls.lock().push((store_id, batches));
        Ok(())
    }
}

pub fn vertex(key: u64) -> OperationBlob {
    OperationBlob::new(OperationKind::OverwriteVertex, key, format!("v{}", key))
}

pub fn batch_of(keys: &[u64]) -> OperationBatch {
    keys.iter().copied().map(vertex).collect()
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
