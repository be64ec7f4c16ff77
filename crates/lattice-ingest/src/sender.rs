//! Reliable delivery of WAL records to storage nodes.
//!
//! [`BatchSender`] runs one sequential lane per store. A record is split by
//! partition, the pieces are grouped per owning store and pushed onto that
//! store's lane. Each lane delivers in arrival order and retries a failed
//! write until it is acknowledged, so a later offset of a queue never
//! reaches a store before an earlier one.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lattice_common::{
    MetaService, OperationBatch, Offset, PartitionId, QueueId, SnapshotId, StoreDataBatch,
    StoreId, StoreWriter, BROADCAST_PARTITION_ID,
};

use crate::backoff::{ExponentialBackoff, RetryConfig};
use crate::config::IngestConfig;
use crate::error::{IngestError, Result};

/// Hand-off point between an ingest processor and store delivery.
#[async_trait]
pub trait DataBatchSender: Send + Sync {
    /// Accept one WAL record for delivery. Returns once the record is queued;
    /// delivery itself is retried until the store acknowledges it. Calls for
    /// the same queue must be made in offset order.
    async fn async_send_with_retry(
        &self,
        request_id: &str,
        queue_id: QueueId,
        snapshot_id: SnapshotId,
        offset: Offset,
        batch: OperationBatch,
    ) -> Result<()>;
}

/// Lane-per-store sender over a [`StoreWriter`].
pub struct BatchSender {
    meta: Arc<dyn MetaService>,
    lanes: Vec<mpsc::UnboundedSender<StoreDataBatch>>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BatchSender {
    /// Spawn one lane per store. Must be called inside a tokio runtime.
    pub fn new(
        meta: Arc<dyn MetaService>,
        store_writer: Arc<dyn StoreWriter>,
        config: &IngestConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let retry = RetryConfig::from(config);
        let send_batch_size = config.send_batch_size.max(1);
        let store_count = meta.store_count();

        let mut lanes = Vec::with_capacity(store_count as usize);
        let mut handles = Vec::with_capacity(store_count as usize);
        for store_id in 0..store_count {
            let (tx, rx) = mpsc::unbounded_channel();
            let lane = SendLane {
                store_id,
                store_writer: store_writer.clone(),
                retry: retry.clone(),
                send_batch_size,
                cancel: cancel.child_token(),
            };
            handles.push(tokio::spawn(lane.run(rx)));
            lanes.push(tx);
        }

        info!(store_count, send_batch_size, "Batch sender started");
        Self {
            meta,
            lanes,
            cancel,
            handles: Mutex::new(handles),
        }
    }

    /// Split a record into the per-store batches it must be delivered as.
    /// Broadcast operations go to every store; stores the record does not
    /// touch get nothing.
    pub fn route(
        &self,
        request_id: &str,
        queue_id: QueueId,
        snapshot_id: SnapshotId,
        offset: Offset,
        batch: &OperationBatch,
    ) -> BTreeMap<StoreId, StoreDataBatch> {
        let split = batch.split_by_partition(|key| self.meta.partition_for_key(key));
        let store_count = self.meta.store_count();

        let mut per_store: BTreeMap<StoreId, BTreeMap<PartitionId, OperationBatch>> =
            BTreeMap::new();
        for (partition_id, partition_batch) in split {
            if partition_id == BROADCAST_PARTITION_ID {
                for store_id in 0..store_count {
                    per_store
                        .entry(store_id)
                        .or_default()
                        .insert(partition_id, partition_batch.clone());
                }
            } else {
                let store_id = self.meta.store_for_partition(partition_id);
                per_store
                    .entry(store_id)
                    .or_default()
                    .insert(partition_id, partition_batch);
            }
        }

        per_store
            .into_iter()
            .map(|(store_id, partitions)| {
                let data_batch = StoreDataBatch::new(request_id, queue_id, snapshot_id, offset)
                    .with_partition_batches(partitions);
                (store_id, data_batch)
            })
            .collect()
    }

    /// Abandon outstanding deliveries and wait for the lanes to exit.
    /// Undelivered records are recovered by WAL replay.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            let _ = handle.await;
        }
        info!("Batch sender stopped");
    }
}

#[async_trait]
impl DataBatchSender for BatchSender {
    async fn async_send_with_retry(
        &self,
        request_id: &str,
        queue_id: QueueId,
        snapshot_id: SnapshotId,
        offset: Offset,
        batch: OperationBatch,
    ) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(IngestError::SenderClosed);
        }
        for (store_id, data_batch) in self.route(request_id, queue_id, snapshot_id, offset, &batch) {
            let lane = self
                .lanes
                .get(store_id as usize)
                .ok_or(IngestError::SenderClosed)?;
            lane.send(data_batch).map_err(|_| IngestError::SenderClosed)?;
        }
        Ok(())
    }
}

struct SendLane {
    store_id: StoreId,
    store_writer: Arc<dyn StoreWriter>,
    retry: RetryConfig,
    send_batch_size: usize,
    cancel: CancellationToken,
}

impl SendLane {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<StoreDataBatch>) {
        loop {
            let first = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(batch) => batch,
                    None => break,
                },
            };

            let mut pending = vec![first];
            while pending.len() < self.send_batch_size {
                match rx.try_recv() {
                    Ok(batch) => pending.push(batch),
                    Err(_) => break,
                }
            }

            if !self.deliver(pending).await {
                break;
            }
        }
        debug!(store_id = self.store_id, "Send lane exited");
    }

    /// Retry until the store acknowledges the whole group. Returns false when
    /// cancelled first.
    async fn deliver(&self, batches: Vec<StoreDataBatch>) -> bool {
        let mut backoff = ExponentialBackoff::new(self.retry.clone());
        loop {
            match self
                .store_writer
                .write_store(self.store_id, batches.clone())
                .await
            {
                Ok(()) => {
                    if backoff.attempt() > 0 {
                        debug!(
                            store_id = self.store_id,
                            "Delivery succeeded after {} retries in {:?}",
                            backoff.attempt(),
                            backoff.elapsed()
                        );
                    }
                    return true;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        store_id = self.store_id,
                        batches = batches.len(),
                        attempt = backoff.attempt(),
                        "write_store failed: {}. Retrying in {:?}",
                        e,
                        delay
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return false,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }
}
