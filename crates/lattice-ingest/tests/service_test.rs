//! Ingest service tests: membership driven lifecycle and snapshot barriers.

mod common;

use std::sync::Arc;

use lattice_common::{LocalDiscovery, NodeInfo, NodeRole, StaticMetaService};
use lattice_ingest::{IngestCollaborators, IngestConfig, IngestError, IngestService, QueueState};
use lattice_wal::MemoryLogService;

use common::{batch_of, eventually, FixedProgress, RecordingSender};

struct Harness {
    service: IngestService,
    log: Arc<MemoryLogService>,
    sender: Arc<RecordingSender>,
    progress: Arc<FixedProgress>,
    discovery: Arc<LocalDiscovery>,
}

/// Two stores and two queues, both owned by ingestor 0.
fn harness() -> Harness {
    harness_with(FixedProgress::new(0))
}

fn harness_with(progress: FixedProgress) -> Harness {
    let log = Arc::new(MemoryLogService::new());
    let sender = Arc::new(RecordingSender::new());
    let progress = Arc::new(progress);
    let discovery = Arc::new(LocalDiscovery::new());
    let deps = IngestCollaborators {
        meta: Arc::new(StaticMetaService::new(2, 1, 2, 2)),
        log_service: log.clone(),
        sender: sender.clone(),
        progress: progress.clone(),
        discovery: discovery.clone(),
    };
    Harness {
        service: IngestService::new(0, IngestConfig::default(), deps),
        log,
        sender,
        progress,
        discovery,
    }
}

fn store(index: u32) -> NodeInfo {
    NodeInfo::new(NodeRole::Store, index)
}

fn all_in(service: &IngestService, state: QueueState) -> bool {
    let states = service.queue_states();
    !states.is_empty() && states.values().all(|s| *s == state)
}

#[tokio::test]
async fn test_processors_wait_for_every_store() {
    let h = harness();
    assert_eq!(h.service.queue_state(0), QueueState::Unassigned);

    h.service.start().await.unwrap();
    assert!(all_in(&h.service, QueueState::AwaitingQuorum));
    assert!(matches!(
        h.service.ingest_batch("req", 0, batch_of(&[1])).await,
        Err(IngestError::QueueNotAvailable(0))
    ));

    h.discovery.join(&[store(0)]);
    h.discovery.join(&[NodeInfo::new(NodeRole::Frontend, 1)]);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(all_in(&h.service, QueueState::AwaitingQuorum));

    h.discovery.join(&[store(1)]);
    assert!(eventually(|| all_in(&h.service, QueueState::Running)).await);

    h.service.ingest_batch("req", 1, batch_of(&[1])).await.unwrap();
    let sent = h.sender.sent_for(1);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].offset, 1);
    assert_eq!(h.service.queue_state(7), QueueState::Unassigned);

    h.service.stop().await;
}

#[tokio::test]
async fn test_advance_snapshot_injects_markers() {
    let h = harness();
    h.discovery.join(&[store(0), store(1)]);
    h.service.start().await.unwrap();
    assert!(eventually(|| all_in(&h.service, QueueState::Running)).await);

    assert_eq!(h.service.advance_ingest_snapshot_id(5).await.unwrap(), 0);
    assert_eq!(h.service.ingest_snapshot_id(), 5);
    for queue_id in [0, 1] {
        let sent = h.sender.sent_for(queue_id);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].request_id, "marker");
        assert_eq!(sent[0].snapshot_id, 5);
        assert!(sent[0].batch.is_marker());
    }

    assert!(matches!(
        h.service.advance_ingest_snapshot_id(5).await,
        Err(IngestError::SnapshotNotIncreasing { current: 5, requested: 5 })
    ));
    assert!(matches!(
        h.service.advance_ingest_snapshot_id(3).await,
        Err(IngestError::SnapshotNotIncreasing { .. })
    ));

    // Data ingested after the bump is logged under the new snapshot id.
    assert_eq!(h.service.ingest_batch("req", 0, batch_of(&[2])).await.unwrap(), 5);
    assert_eq!(h.service.advance_ingest_snapshot_id(6).await.unwrap(), 5);

    h.service.stop().await;
}

#[tokio::test]
async fn test_advance_skips_halted_queue() {
    let h = harness();
    h.discovery.join(&[store(0), store(1)]);
    h.service.start().await.unwrap();
    assert!(eventually(|| all_in(&h.service, QueueState::Running)).await);

    h.log.fail_appends(0, true);
    assert!(h.service.ingest_batch("req", 0, batch_of(&[1])).await.is_err());
    assert!(eventually(|| h.service.queue_state(0) == QueueState::Stopped).await);

    // The halted queue does not fail the barrier; the healthy one is marked.
    assert_eq!(h.service.advance_ingest_snapshot_id(5).await.unwrap(), 0);
    assert_eq!(h.service.advance_ingest_snapshot_id(6).await.unwrap(), 5);
    assert_eq!(h.service.ingest_snapshot_id(), 6);
    assert!(h.sender.sent_for(0).is_empty());
    let markers: Vec<_> = h.sender.sent_for(1).iter().map(|r| r.snapshot_id).collect();
    assert_eq!(markers, vec![5, 6]);

    h.service.stop().await;
}

#[tokio::test]
async fn test_stop_during_start_leaves_no_queues() {
    let h = harness_with(FixedProgress::gated(0));
    let service = Arc::new(h.service);
    let starting = tokio::spawn({
        let service = service.clone();
        async move { service.start().await }
    });
    assert!(eventually(|| h.progress.calls() == 1).await);

    service.stop().await;
    h.progress.open_gate();
    assert!(matches!(
        starting.await.unwrap(),
        Err(IngestError::ServiceStopped)
    ));
    assert!(service.queue_states().is_empty());
}

#[tokio::test]
async fn test_store_churn_recreates_processors() {
    let h = harness();
    h.discovery.join(&[store(0), store(1)]);
    h.service.start().await.unwrap();
    assert!(eventually(|| all_in(&h.service, QueueState::Running)).await);
    assert_eq!(h.progress.calls(), 1);
    h.service.ingest_batch("before", 0, batch_of(&[1])).await.unwrap();

    h.discovery.leave(&[store(1)]);
    assert!(eventually(|| all_in(&h.service, QueueState::Stopped)).await);
    assert!(matches!(
        h.service.ingest_batch("during", 0, batch_of(&[2])).await,
        Err(IngestError::QueueNotAvailable(0))
    ));

    h.discovery.join(&[store(1)]);
    assert!(eventually(|| all_in(&h.service, QueueState::Running)).await);
    assert_eq!(h.progress.calls(), 2);

    // The fresh processor replays from the fetched tail, then continues.
    h.service.ingest_batch("after", 0, batch_of(&[3])).await.unwrap();
    let offsets: Vec<_> = h.sender.sent_for(0).iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![1, 1, 2]);

    h.service.stop().await;
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let h = harness();
    h.discovery.join(&[store(0), store(1)]);
    h.service.start().await.unwrap();
    assert!(eventually(|| all_in(&h.service, QueueState::Running)).await);

    h.service.stop().await;
    let after_first = h.service.queue_states();
    h.service.stop().await;
    assert_eq!(h.service.queue_states(), after_first);
    assert!(all_in(&h.service, QueueState::Stopped));
    assert!(matches!(
        h.service.ingest_batch("req", 0, batch_of(&[1])).await,
        Err(IngestError::QueueNotAvailable(0))
    ));
    assert!(matches!(h.service.start().await, Err(IngestError::ServiceStopped)));
}

#[tokio::test]
async fn test_stop_before_start() {
    let h = harness();
    h.service.stop().await;
    h.service.stop().await;
    assert!(h.service.queue_states().is_empty());
}
