//! Per-queue ingest processor.
//!
//! Every queue is served by one worker task, which is what gives the queue
//! its total order. The worker first replays the WAL from `tail_offset + 1`,
//! then takes ingest requests off a bounded channel: it reads the current
//! ingest snapshot id, appends the batch to the WAL and forwards the record
//! to the sender before replying to the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use lattice_common::{OperationBatch, Offset, QueueId, SnapshotId};
use lattice_wal::{LogService, LogWriter, WalError};

use crate::error::{IngestError, Result};
use crate::sender::DataBatchSender;

/// Lifecycle of a processor. A stopped or failed processor is never
/// restarted; a new one is created instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Created,
    Running,
    Stopped,
    Failed,
}

struct IngestTask {
    request_id: String,
    batch: OperationBatch,
    reply: oneshot::Sender<Result<SnapshotId>>,
}

#[derive(Default)]
struct Control {
    tail_offset: Option<Offset>,
    tx: Option<mpsc::Sender<IngestTask>>,
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

pub struct IngestProcessor {
    queue_id: QueueId,
    log_service: Arc<dyn LogService>,
    sender: Arc<dyn DataBatchSender>,
    ingest_snapshot_id: Arc<AtomicU64>,
    queue_buffer_capacity: usize,
    state: Arc<Mutex<ProcessorState>>,
    control: Mutex<Control>,
}

impl IngestProcessor {
    pub fn new(
        queue_id: QueueId,
        log_service: Arc<dyn LogService>,
        sender: Arc<dyn DataBatchSender>,
        ingest_snapshot_id: Arc<AtomicU64>,
        queue_buffer_capacity: usize,
    ) -> Self {
        Self {
            queue_id,
            log_service,
            sender,
            ingest_snapshot_id,
            queue_buffer_capacity: queue_buffer_capacity.max(1),
            state: Arc::new(Mutex::new(ProcessorState::Created)),
            control: Mutex::new(Control::default()),
        }
    }

    pub fn queue_id(&self) -> QueueId {
        self.queue_id
    }

    pub fn state(&self) -> ProcessorState {
        *self.state.lock()
    }

    /// Last offset already delivered for this queue. Replay resumes right
    /// after it. Must be set before [`start`](Self::start).
    pub fn set_tail_offset(&self, offset: Offset) {
        self.control.lock().tail_offset = Some(offset);
    }

    /// Spawn the queue worker. Starting a running processor is a no-op.
    /// Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut control = self.control.lock();
        let mut state = self.state.lock();
        match *state {
            ProcessorState::Running => return Ok(()),
            ProcessorState::Stopped => return Err(IngestError::Stopped(self.queue_id)),
            ProcessorState::Failed => return Err(IngestError::Failed(self.queue_id)),
            ProcessorState::Created => {}
        }
        let tail_offset = control
            .tail_offset
            .ok_or(IngestError::TailOffsetNotSet(self.queue_id))?;

        let (tx, rx) = mpsc::channel(self.queue_buffer_capacity);
        let cancel = CancellationToken::new();
        let worker = QueueWorker {
            queue_id: self.queue_id,
            tail_offset,
            log_service: self.log_service.clone(),
            sender: self.sender.clone(),
            ingest_snapshot_id: self.ingest_snapshot_id.clone(),
            state: self.state.clone(),
        };

        control.handle = Some(tokio::spawn(worker.run(rx, cancel.clone())));
        control.tx = Some(tx);
        control.cancel = Some(cancel);
        *state = ProcessorState::Running;

        info!(queue_id = self.queue_id, tail_offset, "Ingest processor started");
        Ok(())
    }

    /// Append `batch` to the queue and hand it to the sender. Resolves with
    /// the snapshot id the batch was logged under.
    pub async fn ingest_batch(
        &self,
        request_id: impl Into<String>,
        batch: OperationBatch,
    ) -> Result<SnapshotId> {
        let tx = {
            let control = self.control.lock();
            match (self.state(), control.tx.as_ref()) {
                (ProcessorState::Running, Some(tx)) => tx.clone(),
                (ProcessorState::Created, _) => return Err(IngestError::NotStarted(self.queue_id)),
                (ProcessorState::Failed, _) => return Err(IngestError::Failed(self.queue_id)),
                _ => return Err(IngestError::Stopped(self.queue_id)),
            }
        };

        let (reply, rx) = oneshot::channel();
        let task = IngestTask {
            request_id: request_id.into(),
            batch,
            reply,
        };
        tx.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => IngestError::BufferFull(self.queue_id),
            mpsc::error::TrySendError::Closed(_) => self.closed_error(),
        })?;

        rx.await.map_err(|_| self.closed_error())?
    }

    /// Stop the worker and close the WAL writer. Safe to call before
    /// `start`, twice, or concurrently with in-flight requests; pending
    /// requests are answered with [`IngestError::Stopped`].
    pub async fn stop(&self) {
        let (cancel, handle) = {
            let mut control = self.control.lock();
            let mut state = self.state.lock();
            if *state == ProcessorState::Created || *state == ProcessorState::Running {
                *state = ProcessorState::Stopped;
            }
            control.tx = None;
            (control.cancel.take(), control.handle.take())
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(queue_id = self.queue_id, "Ingest worker panicked: {}", e);
            }
            info!(queue_id = self.queue_id, "Ingest processor stopped");
        }
    }

    fn closed_error(&self) -> IngestError {
        match self.state() {
            ProcessorState::Failed => IngestError::Failed(self.queue_id),
            _ => IngestError::Stopped(self.queue_id),
        }
    }
}

/// State moved into the spawned worker task.
struct QueueWorker {
    queue_id: QueueId,
    tail_offset: Offset,
    log_service: Arc<dyn LogService>,
    sender: Arc<dyn DataBatchSender>,
    ingest_snapshot_id: Arc<AtomicU64>,
    state: Arc<Mutex<ProcessorState>>,
}

impl QueueWorker {
    async fn run(self, mut rx: mpsc::Receiver<IngestTask>, cancel: CancellationToken) {
        let result = self.process(&mut rx, &cancel).await;

        let failed = match result {
            Ok(()) => false,
            Err(e) => {
                error!(queue_id = self.queue_id, "Ingest processor halted: {}", e);
                *self.state.lock() = ProcessorState::Failed;
                true
            }
        };

        rx.close();
        while let Ok(task) = rx.try_recv() {
            let error = if failed {
                IngestError::Failed(self.queue_id)
            } else {
                IngestError::Stopped(self.queue_id)
            };
            let _ = task.reply.send(Err(error));
        }
    }

    async fn process(
        &self,
        rx: &mut mpsc::Receiver<IngestTask>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut writer = self
            .log_service
            .create_writer(self.queue_id)
            .await
            .map_err(|e| self.wal_error(e))?;

        let result = match self.replay(cancel).await {
            Ok(()) => self.serve(writer.as_mut(), rx, cancel).await,
            Err(e) => Err(e),
        };

        if let Err(e) = writer.close().await {
            warn!(queue_id = self.queue_id, "Failed to close WAL writer: {}", e);
        }
        result
    }

    /// Re-send every record after the tail offset, in offset order.
    async fn replay(&self, cancel: &CancellationToken) -> Result<()> {
        let from_offset = self.tail_offset + 1;
        let mut reader = self
            .log_service
            .create_reader(self.queue_id, from_offset)
            .await
            .map_err(|e| self.wal_error(e))?;

        let mut replayed = 0u64;
        while !cancel.is_cancelled() {
            let Some(entry) = reader.read_next().await.map_err(|e| self.wal_error(e))? else {
                break;
            };
            self.sender
                .async_send_with_retry("", self.queue_id, entry.snapshot_id, entry.offset, entry.batch)
                .await?;
            replayed += 1;
        }
        reader.close().await.map_err(|e| self.wal_error(e))?;

        info!(queue_id = self.queue_id, from_offset, replayed, "WAL replay finished");
        Ok(())
    }

    async fn serve(
        &self,
        writer: &mut dyn LogWriter,
        rx: &mut mpsc::Receiver<IngestTask>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let task = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                task = rx.recv() => match task {
                    Some(task) => task,
                    None => return Ok(()),
                },
            };

            let snapshot_id = self.ingest_snapshot_id.load(Ordering::SeqCst);
            let offset = match writer.append(snapshot_id, &task.batch).await {
                Ok(offset) => offset,
                Err(e) => {
                    error!(queue_id = self.queue_id, snapshot_id, "WAL append failed: {}", e);
                    let _ = task.reply.send(Err(self.wal_error(e)));
                    return Err(IngestError::Failed(self.queue_id));
                }
            };

            if let Err(e) = self
                .sender
                .async_send_with_retry(&task.request_id, self.queue_id, snapshot_id, offset, task.batch)
                .await
            {
                let _ = task.reply.send(Err(IngestError::SenderClosed));
                return Err(e);
            }

            debug!(queue_id = self.queue_id, snapshot_id, offset, "Batch ingested");
            let _ = task.reply.send(Ok(snapshot_id));
        }
    }

    fn wal_error(&self, source: WalError) -> IngestError {
        IngestError::Wal {
            queue_id: self.queue_id,
            source,
        }
    }
}
