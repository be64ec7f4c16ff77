//! Segmented file-backed log service.
//!
//! Each queue lives in `<data_dir>/queue_<id>/` as a sequence of segment
//! files named `wal_<segment_id>_<base_offset>.log`. Records are appended to
//! the newest segment; a segment is rotated once it would exceed the
//! configured size.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use lattice_common::{OperationBatch, Offset, QueueId, ReadLogEntry, SnapshotId};

use crate::config::WalConfig;
use crate::error::{Result, WalError};
use crate::record::{Decoded, LogRecord};
use crate::service::{LogReader, LogService, LogWriter};

/// Location of one segment on disk.
#[derive(Debug, Clone)]
struct SegmentFile {
    id: u64,
    base_offset: Offset,
    path: PathBuf,
}

/// Log service storing every queue as segment files under `data_dir`.
pub struct FileLogService {
    config: WalConfig,
    open_writers: Arc<Mutex<HashSet<QueueId>>>,
}

impl FileLogService {
    #[instrument(skip(config), fields(data_dir = %config.data_dir.display()))]
    pub async fn new(config: WalConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir).await?;
        info!(
            segment_size = config.segment_size,
            fsync = config.fsync,
            "File log service ready"
        );
        Ok(Self {
            config,
            open_writers: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    fn queue_dir(&self, queue_id: QueueId) -> PathBuf {
        self.config.data_dir.join(format!("queue_{}", queue_id))
    }
}

#[async_trait]
impl LogService for FileLogService {
    async fn create_writer(&self, queue_id: QueueId) -> Result<Box<dyn LogWriter>> {
        if !self.open_writers.lock().insert(queue_id) {
            return Err(WalError::WriterAlreadyOpen(queue_id));
        }

        match FileLogWriter::open(
            queue_id,
            self.queue_dir(queue_id),
            &self.config,
            self.open_writers.clone(),
        )
        .await
        {
            Ok(writer) => Ok(Box::new(writer)),
            Err(e) => {
                self.open_writers.lock().remove(&queue_id);
                Err(e)
            }
        }
    }

    async fn create_reader(
        &self,
        queue_id: QueueId,
        from_offset: Offset,
    ) -> Result<Box<dyn LogReader>> {
        debug!(queue_id, from_offset, "Opening WAL reader");
        Ok(Box::new(FileLogReader {
            dir: self.queue_dir(queue_id),
            from_offset,
            current: None,
            last_segment_id: None,
            closed: false,
        }))
    }

    #[instrument(skip(self))]
    async fn delete_before(&self, queue_id: QueueId, offset: Offset) -> Result<usize> {
        let segments = list_segments(&self.queue_dir(queue_id)).await?;
        let mut removed = 0;

        // A segment only holds records below `offset` when its successor
        // starts at or before it. The newest segment is never removed.
        for pair in segments.windows(2) {
            let (segment, next) = (&pair[0], &pair[1]);
            if next.base_offset > offset {
                break;
            }
            fs::remove_file(&segment.path).await?;
            debug!(segment_id = segment.id, base_offset = segment.base_offset, "Removed WAL segment");
            removed += 1;
        }

        if removed > 0 {
            info!(queue_id, offset, removed, "Recycled WAL segments");
        }
        Ok(removed)
    }
}

/// Single writer of one queue.
pub struct FileLogWriter {
    queue_id: QueueId,
    dir: PathBuf,
    segment_size: u64,
    fsync: bool,
    file: File,
    segment_id: u64,
    segment_bytes: u64,
    segment_records: u64,
    next_offset: Offset,
    open_writers: Arc<Mutex<HashSet<QueueId>>>,
    closed: bool,
}

impl FileLogWriter {
    #[instrument(skip(dir, config, open_writers), fields(dir = %dir.display()))]
    async fn open(
        queue_id: QueueId,
        dir: PathBuf,
        config: &WalConfig,
        open_writers: Arc<Mutex<HashSet<QueueId>>>,
    ) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        let segments = list_segments(&dir).await?;

        let (segment_id, base_offset, scan) = match segments.last() {
            None => (0, 1, SegmentScan::default()),
            Some(last) => {
                let data = fs::read(&last.path).await?;
                let scan = scan_segment(&data, last.base_offset)?;
                if scan.valid_len < data.len() {
                    warn!(
                        segment_id = last.id,
                        torn_bytes = data.len() - scan.valid_len,
                        "Truncating torn WAL tail"
                    );
                }
                (last.id, last.base_offset, scan)
            }
        };

        let path = segment_path(&dir, segment_id, base_offset);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.set_len(scan.valid_len as u64).await?;

        let next_offset = base_offset + scan.records;
        info!(
            queue_id,
            segment_id,
            next_offset,
            "WAL writer opened"
        );

        Ok(Self {
            queue_id,
            dir,
            segment_size: config.segment_size,
            fsync: config.fsync,
            file,
            segment_id,
            segment_bytes: scan.valid_len as u64,
            segment_records: scan.records,
            next_offset,
            open_writers,
            closed: false,
        })
    }

    async fn rotate(&mut self, base_offset: Offset) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;

        let segment_id = self.segment_id + 1;
        let path = segment_path(&self.dir, segment_id, base_offset);
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        self.segment_id = segment_id;
        self.segment_bytes = 0;
        self.segment_records = 0;

        info!(queue_id = self.queue_id, segment_id, base_offset, "Rotated WAL segment");
        Ok(())
    }

    fn release(&self) {
        self.open_writers.lock().remove(&self.queue_id);
    }
}

#[async_trait]
impl LogWriter for FileLogWriter {
    #[instrument(skip(self, batch), fields(
        queue_id = self.queue_id,
        offset = tracing::field::Empty,
        append_duration_us = tracing::field::Empty
    ))]
    async fn append(&mut self, snapshot_id: SnapshotId, batch: &OperationBatch) -> Result<Offset> {
        if self.closed {
            return Err(WalError::Closed);
        }
        let start = Instant::now();
        let offset = self.next_offset;
        let bytes = LogRecord::encode(offset, snapshot_id, batch)?;

        if self.segment_records > 0 && self.segment_bytes + bytes.len() as u64 > self.segment_size {
            self.rotate(offset).await?;
        }

        self.file.write_all(&bytes).await?;
        self.file.flush().await?;
        if self.fsync {
            self.file.sync_data().await?;
        }

        self.segment_bytes += bytes.len() as u64;
        self.segment_records += 1;
        self.next_offset += 1;

        tracing::Span::current()
            .record("offset", offset)
            .record("append_duration_us", start.elapsed().as_micros() as u64);
        Ok(offset)
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = async {
            self.file.flush().await?;
            self.file.sync_all().await
        }
        .await;
        self.release();
        debug!(queue_id = self.queue_id, "WAL writer closed");
        Ok(result?)
    }
}

impl Drop for FileLogWriter {
    fn drop(&mut self) {
        if !self.closed {
            self.release();
        }
    }
}

struct OpenSegment {
    id: u64,
    path: PathBuf,
    data: Vec<u8>,
    pos: usize,
}

/// Sequential reader over the segments of one queue.
pub struct FileLogReader {
    dir: PathBuf,
    from_offset: Offset,
    current: Option<OpenSegment>,
    last_segment_id: Option<u64>,
    closed: bool,
}

impl FileLogReader {
    /// Load the segment following the one last read, or the segment holding
    /// `from_offset` on the first call.
    async fn open_next_segment(&mut self) -> Result<bool> {
        let segments = list_segments(&self.dir).await?;
        let next = match self.last_segment_id {
            Some(last) => segments.iter().find(|s| s.id > last),
            None => segments
                .iter()
                .rev()
                .find(|s| s.base_offset <= self.from_offset)
                .or_else(|| segments.first()),
        };
        let Some(segment) = next else {
            return Ok(false);
        };

        let data = fs::read(&segment.path).await?;
        self.current = Some(OpenSegment {
            id: segment.id,
            path: segment.path.clone(),
            data,
            pos: 0,
        });
        Ok(true)
    }
}

#[async_trait]
impl LogReader for FileLogReader {
    async fn read_next(&mut self) -> Result<Option<ReadLogEntry>> {
        loop {
            if self.closed {
                return Err(WalError::Closed);
            }
            if self.current.is_none() && !self.open_next_segment().await? {
                return Ok(None);
            }
            let Some(segment) = self.current.as_mut() else {
                return Ok(None);
            };

            match LogRecord::decode(&segment.data[segment.pos..])? {
                Decoded::Record(record, consumed) => {
                    segment.pos += consumed;
                    if record.offset < self.from_offset {
                        continue;
                    }
                    return Ok(Some(record.into()));
                }
                Decoded::End | Decoded::Torn => {
                    let has_successor = list_segments(&self.dir)
                        .await?
                        .iter()
                        .any(|s| s.id > segment.id);
                    if has_successor {
                        self.last_segment_id = Some(segment.id);
                        self.current = None;
                        continue;
                    }

                    // Active segment: pick up records appended since it was loaded.
                    let data = fs::read(&segment.path).await?;
                    if data.len() > segment.data.len() {
                        segment.data = data;
                        continue;
                    }
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.current = None;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SegmentScan {
    records: u64,
    valid_len: usize,
}

/// Walk a segment and report how many contiguous records it holds and where
/// the last complete record ends.
fn scan_segment(data: &[u8], base_offset: Offset) -> Result<SegmentScan> {
    let mut scan = SegmentScan::default();
    loop {
        match LogRecord::decode(&data[scan.valid_len..])? {
            Decoded::Record(record, consumed) => {
                let expected = base_offset + scan.records;
                if record.offset != expected {
                    return Err(WalError::CorruptRecord {
                        offset: record.offset,
                        reason: format!("expected offset {}", expected),
                    });
                }
                scan.records += 1;
                scan.valid_len += consumed;
            }
            Decoded::End | Decoded::Torn => return Ok(scan),
        }
    }
}

fn segment_path(dir: &Path, segment_id: u64, base_offset: Offset) -> PathBuf {
    dir.join(format!("wal_{}_{}.log", segment_id, base_offset))
}

fn parse_segment_name(name: &str) -> Option<(u64, Offset)> {
    let stem = name.strip_prefix("wal_")?.strip_suffix(".log")?;
    let (id, base) = stem.split_once('_')?;
    Some((id.parse().ok()?, base.parse().ok()?))
}

/// Segments of a queue directory ordered by segment id.
async fn list_segments(dir: &Path) -> Result<Vec<SegmentFile>> {
    if !fs::try_exists(dir).await? {
        return Ok(Vec::new());
    }

    let mut segments = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some((id, base_offset)) = name.to_str().and_then(parse_segment_name) else {
            continue;
        };
        segments.push(SegmentFile {
            id,
            base_offset,
            path: entry.path(),
        });
    }
    segments.sort_by_key(|s| s.id);
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_common::{OperationBlob, OperationKind};
    use tempfile::TempDir;

    fn batch(key: u64) -> OperationBatch {
        OperationBatch::new(vec![OperationBlob::new(
            OperationKind::OverwriteVertex,
            key,
            format!("vertex-{}", key),
        )])
    }

    fn config(dir: &TempDir, segment_size: u64) -> WalConfig {
        WalConfig {
            data_dir: dir.path().to_path_buf(),
            segment_size,
            fsync: false,
        }
    }

    async fn read_all(service: &FileLogService, queue_id: QueueId, from: Offset) -> Vec<ReadLogEntry> {
        let mut reader = service.create_reader(queue_id, from).await.unwrap();
        let mut entries = Vec::new();
        while let Some(entry) = reader.read_next().await.unwrap() {
            entries.push(entry);
        }
        reader.close().await.unwrap();
        entries
    }

    #[tokio::test]
    async fn test_offsets_are_contiguous_from_one() {
        let dir = TempDir::new().unwrap();
        let service = FileLogService::new(config(&dir, 1024 * 1024)).await.unwrap();

        let mut writer = service.create_writer(0).await.unwrap();
        assert_eq!(writer.append(1, &batch(1)).await.unwrap(), 1);
        assert_eq!(writer.append(1, &batch(2)).await.unwrap(), 2);
        assert_eq!(writer.append(2, &batch(3)).await.unwrap(), 3);
        writer.close().await.unwrap();

        let entries = read_all(&service, 0, 1).await;
        assert_eq!(entries.iter().map(|e| e.offset).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(entries[2].snapshot_id, 2);
        assert_eq!(entries[2].batch, batch(3));

        let tail = read_all(&service, 0, 3).await;
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].offset, 3);
    }

    #[tokio::test]
    async fn test_single_writer_per_queue() {
        let dir = TempDir::new().unwrap();
        let service = FileLogService::new(config(&dir, 1024 * 1024)).await.unwrap();

        let mut writer = service.create_writer(3).await.unwrap();
        assert!(matches!(
            service.create_writer(3).await,
            Err(WalError::WriterAlreadyOpen(3))
        ));
        // Other queues are independent.
        let mut other = service.create_writer(4).await.unwrap();
        other.close().await.unwrap();

        writer.append(1, &batch(1)).await.unwrap();
        writer.close().await.unwrap();
        assert!(matches!(writer.append(1, &batch(2)).await, Err(WalError::Closed)));

        let mut reopened = service.create_writer(3).await.unwrap();
        assert_eq!(reopened.append(1, &batch(2)).await.unwrap(), 2);
        drop(reopened);
        assert!(service.create_writer(3).await.is_ok());
    }

    #[tokio::test]
    async fn test_rotation_and_delete_before() {
        let dir = TempDir::new().unwrap();
        // Small enough that every record gets its own segment.
        let service = FileLogService::new(config(&dir, 16)).await.unwrap();

        let mut writer = service.create_writer(0).await.unwrap();
        for key in 1..=5 {
            writer.append(1, &batch(key)).await.unwrap();
        }
        writer.close().await.unwrap();

        let segments = list_segments(&service.queue_dir(0)).await.unwrap();
        assert_eq!(segments.len(), 5);
        assert_eq!(segments.iter().map(|s| s.base_offset).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);

        let entries = read_all(&service, 0, 2).await;
        assert_eq!(entries.iter().map(|e| e.offset).collect::<Vec<_>>(), vec![2, 3, 4, 5]);

        assert_eq!(service.delete_before(0, 4).await.unwrap(), 3);
        let entries = read_all(&service, 0, 4).await;
        assert_eq!(entries.iter().map(|e| e.offset).collect::<Vec<_>>(), vec![4, 5]);

        // The newest segment always survives.
        assert_eq!(service.delete_before(0, 100).await.unwrap(), 1);
        let entries = read_all(&service, 0, 1).await;
        assert_eq!(entries.iter().map(|e| e.offset).collect::<Vec<_>>(), vec![5]);
    }

    #[tokio::test]
    async fn test_torn_tail_truncated_on_reopen() {
        let dir = TempDir::new().unwrap();
        let service = FileLogService::new(config(&dir, 1024 * 1024)).await.unwrap();

        let mut writer = service.create_writer(0).await.unwrap();
        writer.append(1, &batch(1)).await.unwrap();
        writer.append(1, &batch(2)).await.unwrap();
        writer.close().await.unwrap();

        let segment = segment_path(&service.queue_dir(0), 0, 1);
        let mut file = OpenOptions::new().append(true).open(&segment).await.unwrap();
        file.write_all(&[0x77, 0x1A, 0x01]).await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        // The torn bytes read as end of log.
        assert_eq!(read_all(&service, 0, 1).await.len(), 2);

        let mut writer = service.create_writer(0).await.unwrap();
        assert_eq!(writer.append(2, &batch(3)).await.unwrap(), 3);
        writer.close().await.unwrap();

        let entries = read_all(&service, 0, 1).await;
        assert_eq!(entries.iter().map(|e| e.offset).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_reader_sees_later_appends() {
        let dir = TempDir::new().unwrap();
        let service = FileLogService::new(config(&dir, 1024 * 1024)).await.unwrap();

        let mut writer = service.create_writer(0).await.unwrap();
        writer.append(1, &batch(1)).await.unwrap();

        let mut reader = service.create_reader(0, 1).await.unwrap();
        assert_eq!(reader.read_next().await.unwrap().map(|e| e.offset), Some(1));
        assert!(reader.read_next().await.unwrap().is_none());

        writer.append(1, &batch(2)).await.unwrap();
        assert_eq!(reader.read_next().await.unwrap().map(|e| e.offset), Some(2));
        writer.close().await.unwrap();
    }

    #[test]
    fn test_parse_segment_name() {
        assert_eq!(parse_segment_name("wal_3_120.log"), Some((3, 120)));
        assert_eq!(parse_segment_name("wal_3.log"), None);
        assert_eq!(parse_segment_name("queue_3"), None);
    }
}
