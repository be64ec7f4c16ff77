//! In-memory log service for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use lattice_common::{OperationBatch, Offset, QueueId, ReadLogEntry, SnapshotId};

use crate::error::{Result, WalError};
use crate::service::{LogReader, LogService, LogWriter};

struct QueueLog {
    entries: Vec<ReadLogEntry>,
    next_offset: Offset,
    writer_open: bool,
    fail_appends: bool,
}

impl Default for QueueLog {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_offset: 1,
            writer_open: false,
            fail_appends: false,
        }
    }
}

type Queues = Arc<Mutex<HashMap<QueueId, QueueLog>>>;

/// Log service keeping every queue in memory. Nothing survives a restart.
#[derive(Clone, Default)]
pub struct MemoryLogService {
    queues: Queues,
}

impl MemoryLogService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a queue with an existing record. Offsets must increase; the next
    /// append continues after the seeded record.
    pub fn preload(&self, queue_id: QueueId, entry: ReadLogEntry) -> Result<()> {
        let mut queues = self.queues.lock();
        let log = queues.entry(queue_id).or_default();
        if entry.offset < log.next_offset {
            return Err(WalError::CorruptRecord {
                offset: entry.offset,
                reason: format!("expected offset >= {}", log.next_offset),
            });
        }
        log.next_offset = entry.offset + 1;
        log.entries.push(entry);
        Ok(())
    }

    /// Snapshot of the records currently held for a queue.
    pub fn entries(&self, queue_id: QueueId) -> Vec<ReadLogEntry> {
        self.queues
            .lock()
            .get(&queue_id)
            .map(|log| log.entries.clone())
            .unwrap_or_default()
    }

    /// Make every subsequent append on the queue fail with an I/O error.
    pub fn fail_appends(&self, queue_id: QueueId, fail: bool) {
        self.queues.lock().entry(queue_id).or_default().fail_appends = fail;
    }
}

#[async_trait]
impl LogService for MemoryLogService {
    async fn create_writer(&self, queue_id: QueueId) -> Result<Box<dyn LogWriter>> {
        let mut queues = self.queues.lock();
        let log = queues.entry(queue_id).or_default();
        if log.writer_open {
            return Err(WalError::WriterAlreadyOpen(queue_id));
        }
        log.writer_open = true;
        Ok(Box::new(MemoryLogWriter {
            queue_id,
            queues: self.queues.clone(),
            closed: false,
        }))
    }

    async fn create_reader(
        &self,
        queue_id: QueueId,
        from_offset: Offset,
    ) -> Result<Box<dyn LogReader>> {
        Ok(Box::new(MemoryLogReader {
            queue_id,
            queues: self.queues.clone(),
            next_offset: from_offset,
            closed: false,
        }))
    }

    async fn delete_before(&self, queue_id: QueueId, offset: Offset) -> Result<usize> {
        let mut queues = self.queues.lock();
        let Some(log) = queues.get_mut(&queue_id) else {
            return Ok(0);
        };
        let before = log.entries.len();
        log.entries.retain(|entry| entry.offset >= offset);
        let removed = before - log.entries.len();
        debug!(queue_id, offset, removed, "Dropped in-memory WAL records");
        Ok(removed)
    }
}

struct MemoryLogWriter {
    queue_id: QueueId,
    queues: Queues,
    closed: bool,
}

impl MemoryLogWriter {
    fn release(&self) {
        if let Some(log) = self.queues.lock().get_mut(&self.queue_id) {
            log.writer_open = false;
        }
    }
}

#[async_trait]
impl LogWriter for MemoryLogWriter {
    async fn append(&mut self, snapshot_id: SnapshotId, batch: &OperationBatch) -> Result<Offset> {
        if self.closed {
            return Err(WalError::Closed);
        }
        let mut queues = self.queues.lock();
        let log = queues.entry(self.queue_id).or_default();
        if log.fail_appends {
            return Err(WalError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("append to queue {} rejected", self.queue_id),
            )));
        }
        let offset = log.next_offset;
        log.entries.push(ReadLogEntry {
            offset,
            snapshot_id,
            batch: batch.clone(),
        });
        log.next_offset += 1;
        Ok(offset)
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.release();
        }
        Ok(())
    }
}

impl Drop for MemoryLogWriter {
    fn drop(&mut self) {
        if !self.closed {
            self.release();
        }
    }
}

struct MemoryLogReader {
    queue_id: QueueId,
    queues: Queues,
    next_offset: Offset,
    closed: bool,
}

#[async_trait]
impl LogReader for MemoryLogReader {
    async fn read_next(&mut self) -> Result<Option<ReadLogEntry>> {
        if self.closed {
            return Err(WalError::Closed);
        }
        let queues = self.queues.lock();
        let entry = queues.get(&self.queue_id).and_then(|log| {
            log.entries
                .iter()
                .find(|entry| entry.offset >= self.next_offset)
                .cloned()
        });
        if let Some(entry) = &entry {
            self.next_offset = entry.offset + 1;
        }
        Ok(entry)
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
