//! Ingest processor tests: replay, live ingestion and failure handling.

mod common;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use lattice_common::{OperationBatch, ReadLogEntry};
use lattice_ingest::{IngestError, IngestProcessor, ProcessorState};
use lattice_wal::{FileLogService, LogService, MemoryLogService, WalConfig};
use tempfile::TempDir;

use common::{batch_of, eventually, RecordingSender};

fn processor(
    log: Arc<dyn LogService>,
    sender: Arc<RecordingSender>,
    snapshot_id: u64,
    capacity: usize,
) -> IngestProcessor {
    IngestProcessor::new(0, log, sender, Arc::new(AtomicU64::new(snapshot_id)), capacity)
}

#[tokio::test]
async fn test_replay_precedes_new_batches() {
    let log = Arc::new(MemoryLogService::new());
    for offset in [51, 52] {
        log.preload(
            0,
            ReadLogEntry {
                offset,
                snapshot_id: 4,
                batch: batch_of(&[offset]),
            },
        )
        .unwrap();
    }
    let sender = Arc::new(RecordingSender::new());
    let processor = processor(log.clone(), sender.clone(), 9, 16);

    processor.set_tail_offset(50);
    processor.start().unwrap();
    let snapshot_id = processor.ingest_batch("req-1", batch_of(&[7])).await.unwrap();
    assert_eq!(snapshot_id, 9);

    let sent = sender.sent();
    let offsets: Vec<_> = sent.iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![51, 52, 53]);
    assert_eq!(sent[0].request_id, "");
    assert_eq!(sent[1].request_id, "");
    assert_eq!(sent[0].snapshot_id, 4);
    assert_eq!(sent[2].request_id, "req-1");
    assert_eq!(sent[2].snapshot_id, 9);
    assert_eq!(sent[2].batch, batch_of(&[7]));

    processor.stop().await;
}

#[tokio::test]
async fn test_offsets_strictly_increase_under_concurrent_callers() {
    let log = Arc::new(MemoryLogService::new());
    let sender = Arc::new(RecordingSender::new());
    let processor = Arc::new(processor(log.clone(), sender.clone(), 1, 64));
    processor.set_tail_offset(0);
    processor.start().unwrap();

    let mut handles = Vec::new();
    for key in 0..20u64 {
        let processor = processor.clone();
        handles.push(tokio::spawn(async move {
            processor.ingest_batch(format!("req-{}", key), batch_of(&[key])).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let offsets: Vec<_> = sender.sent().iter().map(|r| r.offset).collect();
    assert_eq!(offsets, (1..=20).collect::<Vec<_>>());
    processor.stop().await;
}

#[tokio::test]
async fn test_stop_is_idempotent_and_safe_before_start() {
    let log = Arc::new(MemoryLogService::new());
    let sender = Arc::new(RecordingSender::new());

    let never_started = processor(log.clone(), sender.clone(), 1, 4);
    never_started.stop().await;
    never_started.stop().await;
    assert_eq!(never_started.state(), ProcessorState::Stopped);

    let processor = processor(log.clone(), sender.clone(), 1, 4);
    assert!(matches!(
        processor.ingest_batch("early", batch_of(&[1])).await,
        Err(IngestError::NotStarted(0))
    ));
    processor.set_tail_offset(0);
    processor.start().unwrap();
    processor.ingest_batch("a", batch_of(&[1])).await.unwrap();

    processor.stop().await;
    processor.stop().await;
    assert_eq!(processor.state(), ProcessorState::Stopped);
    assert!(matches!(
        processor.ingest_batch("late", batch_of(&[2])).await,
        Err(IngestError::Stopped(0))
    ));
    assert!(matches!(processor.start(), Err(IngestError::Stopped(0))));

    // The writer was released, so a replacement processor can take the queue.
    let replacement = IngestProcessor::new(0, log, sender.clone(), Arc::new(AtomicU64::new(1)), 4);
    replacement.set_tail_offset(1);
    replacement.start().unwrap();
    replacement.ingest_batch("b", batch_of(&[3])).await.unwrap();
    assert_eq!(sender.sent().last().map(|r| r.offset), Some(2));
    replacement.stop().await;
}

#[tokio::test]
async fn test_start_requires_tail_offset() {
    let processor = processor(
        Arc::new(MemoryLogService::new()),
        Arc::new(RecordingSender::new()),
        1,
        4,
    );
    assert!(matches!(processor.start(), Err(IngestError::TailOffsetNotSet(0))));
    assert_eq!(processor.state(), ProcessorState::Created);
}

#[tokio::test]
async fn test_append_failure_halts_processor() {
    let log = Arc::new(MemoryLogService::new());
    let sender = Arc::new(RecordingSender::new());
    let processor = processor(log.clone(), sender.clone(), 1, 4);
    processor.set_tail_offset(0);
    processor.start().unwrap();
    processor.ingest_batch("ok", batch_of(&[1])).await.unwrap();

    log.fail_appends(0, true);
    assert!(matches!(
        processor.ingest_batch("boom", batch_of(&[2])).await,
        Err(IngestError::Wal { queue_id: 0, .. })
    ));
    assert!(eventually(|| processor.state() == ProcessorState::Failed).await);
    assert!(matches!(
        processor.ingest_batch("after", batch_of(&[3])).await,
        Err(IngestError::Failed(0))
    ));
    assert_eq!(sender.sent().len(), 1);

    processor.stop().await;
    assert_eq!(processor.state(), ProcessorState::Failed);
}

#[tokio::test]
async fn test_full_buffer_rejects() {
    let log = Arc::new(MemoryLogService::new());
    log.preload(
        0,
        ReadLogEntry {
            offset: 1,
            snapshot_id: 1,
            batch: batch_of(&[1]),
        },
    )
    .unwrap();
    // The worker is held inside replay, so nothing leaves the buffer.
    let sender = Arc::new(RecordingSender::gated());
    let processor = processor(log.clone(), sender.clone(), 2, 1);
    processor.set_tail_offset(0);
    processor.start().unwrap();

    let queued = tokio::time::timeout(
        Duration::from_millis(50),
        processor.ingest_batch("queued", batch_of(&[2])),
    )
    .await;
    assert!(queued.is_err());
    assert!(matches!(
        processor.ingest_batch("rejected", OperationBatch::marker()).await,
        Err(IngestError::BufferFull(0))
    ));

    sender.open_gate();
    assert_eq!(processor.ingest_batch("later", batch_of(&[3])).await.unwrap(), 2);
    let offsets: Vec<_> = sender.sent().iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![1, 2, 3]);
    processor.stop().await;
}

#[tokio::test]
async fn test_restart_replays_file_wal_after_tail() {
    let dir = TempDir::new().unwrap();
    let config = WalConfig {
        data_dir: dir.path().to_path_buf(),
        segment_size: 1024 * 1024,
        fsync: false,
    };

    {
        let log = Arc::new(FileLogService::new(config.clone()).await.unwrap());
        let sender = Arc::new(RecordingSender::new());
        let processor = processor(log, sender, 3, 8);
        processor.set_tail_offset(0);
        processor.start().unwrap();
        for key in 1..=3 {
            processor.ingest_batch("first-run", batch_of(&[key])).await.unwrap();
        }
        processor.stop().await;
    }

    let log = Arc::new(FileLogService::new(config).await.unwrap());
    let sender = Arc::new(RecordingSender::new());
    let processor = processor(log, sender.clone(), 4, 8);
    processor.set_tail_offset(1);
    processor.start().unwrap();
    processor.ingest_batch("second-run", batch_of(&[4])).await.unwrap();

    let sent = sender.sent();
    assert_eq!(sent.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![2, 3, 4]);
    assert_eq!(sent[0].batch, batch_of(&[2]));
    assert_eq!(sent[2].snapshot_id, 4);
    processor.stop().await;
}
