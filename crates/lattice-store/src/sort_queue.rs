//! Merge of per-queue batch streams into one snapshot-ordered stream.
//!
//! Every queue delivers its batches in offset order, but queues run
//! independently of each other. The sort queue buffers each queue in its own
//! FIFO and releases batches snapshot by snapshot: for the current snapshot
//! it walks the queues from the highest id down, draining every head that
//! belongs to that snapshot, and only then moves on to the smallest head
//! snapshot left. An open queue with an empty buffer blocks the walk, since
//! it may still deliver a batch of the current snapshot. Batches at or below
//! the highest offset a queue has accepted are redeliveries and are dropped
//! on offer, so every buffer stays in offset order.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use lattice_common::{Offset, QueueId, SnapshotId, StoreDataBatch};

use crate::error::{Result, StoreError};

struct SortState {
    queues: Vec<VecDeque<StoreDataBatch>>,
    closed: Vec<bool>,
    /// Highest offset accepted per queue.
    last_offsets: Vec<Offset>,
    /// Queue inspected next.
    poll_idx: usize,
    /// Snapshot being drained; `None` when it has to be recomputed.
    poll_snapshot: Option<SnapshotId>,
    shutdown: bool,
    len: usize,
}

enum Heads {
    Ready(SnapshotId),
    Waiting,
    Exhausted,
}

impl SortState {
    /// Smallest head snapshot, once every open queue has a head.
    fn min_head(&self) -> Heads {
        let mut min: Option<SnapshotId> = None;
        for (queue, closed) in self.queues.iter().zip(&self.closed) {
            match queue.front() {
                Some(head) => {
                    min = Some(min.map_or(head.snapshot_id, |m| m.min(head.snapshot_id)));
                }
                None if *closed => {}
                None => return Heads::Waiting,
            }
        }
        match min {
            Some(snapshot_id) => Heads::Ready(snapshot_id),
            None => Heads::Exhausted,
        }
    }

    fn advance(&mut self) {
        if self.poll_idx == 0 {
            self.poll_snapshot = None;
        } else {
            self.poll_idx -= 1;
        }
    }

    /// One step of the merge. `Err(())` means the caller has to wait.
    fn try_next(&mut self) -> std::result::Result<Option<StoreDataBatch>, ()> {
        loop {
            if self.shutdown {
                return Ok(None);
            }

            let snapshot_id = match self.poll_snapshot {
                Some(snapshot_id) => snapshot_id,
                None => match self.min_head() {
                    Heads::Ready(snapshot_id) => {
                        self.poll_snapshot = Some(snapshot_id);
                        self.poll_idx = self.queues.len() - 1;
                        snapshot_id
                    }
                    Heads::Waiting => return Err(()),
                    Heads::Exhausted => return Ok(None),
                },
            };

            let idx = self.poll_idx;
            let head_snapshot = match self.queues[idx].front() {
                Some(head) => head.snapshot_id,
                None if self.closed[idx] => {
                    self.advance();
                    continue;
                }
                None => return Err(()),
            };

            if head_snapshot > snapshot_id {
                self.advance();
                continue;
            }
            if head_snapshot < snapshot_id {
                warn!(
                    queue_id = idx,
                    head_snapshot,
                    snapshot_id,
                    "Batch arrived behind the snapshot being drained"
                );
            }

            let batch = self.queues[idx].pop_front();
            if batch.is_some() {
                self.len -= 1;
            }
            return Ok(batch);
        }
    }
}

/// Blocking multi-queue merge ordered by snapshot id.
pub struct SnapshotSortQueue {
    state: Mutex<SortState>,
    available: Condvar,
}

impl SnapshotSortQueue {
    pub fn new(queue_count: usize) -> Self {
        let queue_count = queue_count.max(1);
        Self {
            state: Mutex::new(SortState {
                queues: (0..queue_count).map(|_| VecDeque::new()).collect(),
                closed: vec![false; queue_count],
                last_offsets: vec![0; queue_count],
                poll_idx: queue_count - 1,
                poll_snapshot: None,
                shutdown: false,
                len: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Append a batch to its queue's buffer. Never blocks. A redelivered
    /// batch is acknowledged without being buffered.
    pub fn offer_queue(&self, queue_id: QueueId, batch: StoreDataBatch) -> Result<()> {
        let mut state = self.state.lock();
        let idx = queue_id as usize;
        if idx >= state.queues.len() {
            return Err(StoreError::InvalidQueue(queue_id));
        }
        if state.shutdown || state.closed[idx] {
            return Err(StoreError::QueueClosed(queue_id));
        }
        if batch.offset <= state.last_offsets[idx] {
            debug!(
                queue_id,
                offset = batch.offset,
                accepted = state.last_offsets[idx],
                "Dropping redelivered batch"
            );
            return Ok(());
        }
        state.last_offsets[idx] = batch.offset;
        state.queues[idx].push_back(batch);
        state.len += 1;
        drop(state);
        self.available.notify_all();
        Ok(())
    }

    /// Next batch in apply order. Blocks until one can be released; `None`
    /// once every queue is closed and drained, or after [`close`](Self::close).
    pub fn poll(&self) -> Option<StoreDataBatch> {
        self.poll_until(None)
    }

    /// Like [`poll`](Self::poll), but gives up with `None` after `timeout`.
    pub fn poll_timeout(&self, timeout: Duration) -> Option<StoreDataBatch> {
        self.poll_until(Some(Instant::now() + timeout))
    }

    fn poll_until(&self, deadline: Option<Instant>) -> Option<StoreDataBatch> {
        let mut state = self.state.lock();
        loop {
            match state.try_next() {
                Ok(batch) => return batch,
                Err(()) => {
                    if !self.wait(&mut state, deadline) {
                        return None;
                    }
                }
            }
        }
    }

    /// Returns false when the deadline passed.
    fn wait(&self, state: &mut MutexGuard<'_, SortState>, deadline: Option<Instant>) -> bool {
        match deadline {
            None => {
                self.available.wait(state);
                true
            }
            Some(deadline) => !self.available.wait_until(state, deadline).timed_out(),
        }
    }

    /// Mark a queue as finished. Its remaining batches are still released;
    /// once drained it no longer holds back the merge.
    pub fn close_queue(&self, queue_id: QueueId) {
        let mut state = self.state.lock();
        if let Some(closed) = state.closed.get_mut(queue_id as usize) {
            *closed = true;
            debug!(queue_id, "Sort queue input closed");
        }
        drop(state);
        self.available.notify_all();
    }

    /// Wake every poller and refuse further batches.
    pub fn close(&self) {
        self.state.lock().shutdown = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Batches buffered across all queues.
    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn queue_count(&self) -> usize {
        self.state.lock().queues.len()
    }
}
