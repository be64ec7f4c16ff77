//! Ingestor node service.
//!
//! Owns one [`IngestProcessor`] per queue assigned to this ingestor. A single
//! coordination task consumes membership events and is the only writer of
//! the queue table: processors run while every store is live and are stopped
//! as soon as one leaves. After a stop the processor is recreated, with a
//! freshly fetched tail offset, once the stores are back.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lattice_common::{
    IngestProgressFetcher, MembershipEvent, MetaService, NodeDiscovery, NodeRole, OperationBatch,
    QueueId, SnapshotId,
};
use lattice_wal::LogService;

use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::processor::{IngestProcessor, ProcessorState};
use crate::sender::DataBatchSender;

/// Request id carried by barrier markers.
const MARKER_REQUEST_ID: &str = "marker";

/// Per-queue lifecycle as seen by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Unassigned,
    AwaitingQuorum,
    Running,
    Stopped,
}

/// Collaborators the service is assembled from.
#[derive(Clone)]
pub struct IngestCollaborators {
    pub meta: Arc<dyn MetaService>,
    pub log_service: Arc<dyn LogService>,
    pub sender: Arc<dyn DataBatchSender>,
    pub progress: Arc<dyn IngestProgressFetcher>,
    pub discovery: Arc<dyn NodeDiscovery>,
}

struct QueueSlot {
    state: QueueState,
    processor: Option<Arc<IngestProcessor>>,
}

struct ServiceInner {
    node_index: u32,
    config: IngestConfig,
    deps: IngestCollaborators,
    ingest_snapshot_id: Arc<AtomicU64>,
    queues: RwLock<BTreeMap<QueueId, QueueSlot>>,
}

pub struct IngestService {
    inner: Arc<ServiceInner>,
    cancel: CancellationToken,
    coordinator: Mutex<Option<JoinHandle<()>>>,
    started: Mutex<bool>,
}

impl IngestService {
    pub fn new(node_index: u32, config: IngestConfig, deps: IngestCollaborators) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                node_index,
                config,
                deps,
                ingest_snapshot_id: Arc::new(AtomicU64::new(0)),
                queues: RwLock::new(BTreeMap::new()),
            }),
            cancel: CancellationToken::new(),
            coordinator: Mutex::new(None),
            started: Mutex::new(false),
        }
    }

    /// Build processors for the assigned queues and start following
    /// membership. Processors are held until every store is live.
    pub async fn start(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(IngestError::ServiceStopped);
        }
        if *self.started.lock() {
            return Ok(());
        }

        let queue_ids = self
            .inner
            .deps
            .meta
            .queue_ids_for_ingestor(self.inner.node_index);
        let tail_offsets = self
            .inner
            .deps
            .progress
            .get_tail_offsets(&queue_ids)
            .await?;

        {
            let mut started = self.started.lock();
            if *started {
                return Ok(());
            }
            if self.cancel.is_cancelled() {
                return Err(IngestError::ServiceStopped);
            }
            let mut queues = self.inner.queues.write();
            for (queue_id, tail_offset) in queue_ids.iter().copied().zip(tail_offsets) {
                let processor = self.inner.new_processor(queue_id, tail_offset);
                queues.insert(
                    queue_id,
                    QueueSlot {
                        state: QueueState::AwaitingQuorum,
                        processor: Some(processor),
                    },
                );
            }
            *started = true;
        }

        let events = self.inner.deps.discovery.subscribe();
        let coordinator = Coordinator {
            inner: self.inner.clone(),
            live_stores: BTreeSet::new(),
        };
        let handle = tokio::spawn(coordinator.run(events, self.cancel.clone()));
        *self.coordinator.lock() = Some(handle);

        info!(
            node_index = self.inner.node_index,
            queues = ?queue_ids,
            "Ingest service started"
        );
        Ok(())
    }

    /// Route a batch to the processor of `queue_id`.
    pub async fn ingest_batch(
        &self,
        request_id: impl Into<String>,
        queue_id: QueueId,
        batch: OperationBatch,
    ) -> Result<SnapshotId> {
        let processor = self
            .inner
            .running_processor(queue_id)
            .ok_or(IngestError::QueueNotAvailable(queue_id))?;
        processor.ingest_batch(request_id, batch).await
    }

    /// Raise the ingest snapshot id to `snapshot_id` and log a marker batch
    /// on every running queue. Resolves with the previous snapshot id once
    /// every marker is in the WAL. A queue whose marker cannot be logged has
    /// halted and is skipped; the bump itself stands.
    pub async fn advance_ingest_snapshot_id(&self, snapshot_id: SnapshotId) -> Result<SnapshotId> {
        let previous = self
            .inner
            .ingest_snapshot_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (snapshot_id > current).then_some(snapshot_id)
            })
            .map_err(|current| IngestError::SnapshotNotIncreasing {
                current,
                requested: snapshot_id,
            })?;

        let processors: Vec<Arc<IngestProcessor>> = {
            let queues = self.inner.queues.read();
            queues
                .values()
                .filter(|slot| effective_state(slot) == QueueState::Running)
                .filter_map(|slot| slot.processor.clone())
                .collect()
        };

        let results = join_all(
            processors
                .iter()
                .map(|processor| processor.ingest_batch(MARKER_REQUEST_ID, OperationBatch::marker())),
        )
        .await;
        let mut marked = 0;
        for (processor, result) in processors.iter().zip(results) {
            match result {
                Ok(_) => marked += 1,
                Err(e) => warn!(
                    queue_id = processor.queue_id(),
                    snapshot_id,
                    "Marker not logged, queue skipped: {}",
                    e
                ),
            }
        }

        debug!(previous, snapshot_id, queues = marked, "Advanced ingest snapshot id");
        Ok(previous)
    }

    pub fn ingest_snapshot_id(&self) -> SnapshotId {
        self.inner.ingest_snapshot_id.load(Ordering::SeqCst)
    }

    pub fn queue_state(&self, queue_id: QueueId) -> QueueState {
        self.inner
            .queues
            .read()
            .get(&queue_id)
            .map(effective_state)
            .unwrap_or(QueueState::Unassigned)
    }

    pub fn queue_states(&self) -> BTreeMap<QueueId, QueueState> {
        self.inner
            .queues
            .read()
            .iter()
            .map(|(queue_id, slot)| (*queue_id, effective_state(slot)))
            .collect()
    }

    /// Stop following membership and stop every processor. Idempotent.
    pub async fn stop(&self) {
        {
            let _started = self.started.lock();
            self.cancel.cancel();
        }
        let handle = self.coordinator.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let processors = self.inner.stop_all();
        for processor in processors {
            processor.stop().await;
        }
        info!(node_index = self.inner.node_index, "Ingest service stopped");
    }
}

/// A running slot whose processor halted on a log failure reports as stopped.
fn effective_state(slot: &QueueSlot) -> QueueState {
    match (&slot.state, &slot.processor) {
        (QueueState::Running, Some(processor)) if processor.state() == ProcessorState::Failed => {
            QueueState::Stopped
        }
        (state, _) => *state,
    }
}

impl ServiceInner {
    fn new_processor(&self, queue_id: QueueId, tail_offset: u64) -> Arc<IngestProcessor> {
        let processor = IngestProcessor::new(
            queue_id,
            self.deps.log_service.clone(),
            self.deps.sender.clone(),
            self.ingest_snapshot_id.clone(),
            self.config.queue_buffer_capacity,
        );
        processor.set_tail_offset(tail_offset);
        Arc::new(processor)
    }

    fn running_processor(&self, queue_id: QueueId) -> Option<Arc<IngestProcessor>> {
        let queues = self.queues.read();
        let slot = queues.get(&queue_id)?;
        if slot.state != QueueState::Running {
            return None;
        }
        slot.processor.clone()
    }

    /// Mark every live slot stopped and hand back the processors to stop.
    fn stop_all(&self) -> Vec<Arc<IngestProcessor>> {
        let mut queues = self.queues.write();
        let mut stopped = Vec::new();
        for slot in queues.values_mut() {
            if matches!(slot.state, QueueState::Running | QueueState::AwaitingQuorum) {
                slot.state = QueueState::Stopped;
            }
            if let Some(processor) = slot.processor.take() {
                stopped.push(processor);
            }
        }
        stopped
    }
}

/// Membership-driven owner of the queue table.
struct Coordinator {
    inner: Arc<ServiceInner>,
    live_stores: BTreeSet<u32>,
}

impl Coordinator {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<MembershipEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle(event).await;
        }
        debug!("Ingest coordination loop exited");
    }

    async fn handle(&mut self, event: MembershipEvent) {
        match event {
            MembershipEvent::NodesJoined { role: NodeRole::Store, nodes } => {
                self.live_stores.extend(nodes.iter().map(|n| n.index));
                if self.has_quorum() {
                    self.start_processors().await;
                }
            }
            MembershipEvent::NodesLeft { role: NodeRole::Store, nodes } => {
                for node in &nodes {
                    self.live_stores.remove(&node.index);
                }
                if !self.has_quorum() {
                    self.stop_processors().await;
                }
            }
            _ => {}
        }
    }

    fn has_quorum(&self) -> bool {
        let store_count = self.inner.deps.meta.store_count();
        (0..store_count).all(|index| self.live_stores.contains(&index))
    }

    async fn start_processors(&mut self) {
        // Stopped queues get a new processor resuming from a fresh tail.
        let stopped: Vec<QueueId> = self
            .inner
            .queues
            .read()
            .iter()
            .filter(|(_, slot)| effective_state(slot) == QueueState::Stopped)
            .map(|(queue_id, _)| *queue_id)
            .collect();

        let mut failed_processors = Vec::new();
        let mut fresh = BTreeMap::new();
        if !stopped.is_empty() {
            match self.inner.deps.progress.get_tail_offsets(&stopped).await {
                Ok(tails) => {
                    for (queue_id, tail_offset) in stopped.iter().copied().zip(tails) {
                        fresh.insert(queue_id, self.inner.new_processor(queue_id, tail_offset));
                    }
                }
                Err(e) => warn!(queues = ?stopped, "Cannot fetch tail offsets, queues stay stopped: {}", e),
            }
        }

        // Processors that halted on a log failure are joined before being replaced.
        {
            let queues = self.inner.queues.read();
            for queue_id in fresh.keys() {
                if let Some(processor) = queues.get(queue_id).and_then(|slot| slot.processor.clone()) {
                    failed_processors.push(processor);
                }
            }
        }
        for processor in failed_processors {
            processor.stop().await;
        }

        let mut queues = self.inner.queues.write();
        for (queue_id, slot) in queues.iter_mut() {
            if let Some(processor) = fresh.remove(queue_id) {
                slot.processor = Some(processor);
                slot.state = QueueState::AwaitingQuorum;
            }
            if slot.state != QueueState::AwaitingQuorum {
                continue;
            }
            let Some(processor) = slot.processor.as_ref() else {
                continue;
            };
            match processor.start() {
                Ok(()) => slot.state = QueueState::Running,
                Err(e) => warn!(queue_id, "Failed to start ingest processor: {}", e),
            }
        }
        info!(live_stores = ?self.live_stores, "Store quorum reached, ingest processors running");
    }

    async fn stop_processors(&mut self) {
        let processors: Vec<Arc<IngestProcessor>> = {
            let mut queues = self.inner.queues.write();
            queues
                .values_mut()
                .filter(|slot| slot.state == QueueState::Running)
                .filter_map(|slot| {
                    slot.state = QueueState::Stopped;
                    slot.processor.take()
                })
                .collect()
        };
        if processors.is_empty() {
            return;
        }

        for processor in &processors {
            processor.stop().await;
        }
        info!(
            live_stores = ?self.live_stores,
            stopped = processors.len(),
            "Store quorum lost, ingest processors stopped"
        );
    }
}
