//! Periodic background work of the node.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lattice_common::SnapshotId;
use lattice_ingest::IngestService;
use lattice_store::CommitTracker;
use lattice_wal::LogService;

/// Raise every ingestor to one past the highest ingest snapshot id and
/// return the new id.
pub async fn advance_once(ingestors: &[Arc<IngestService>]) -> lattice_ingest::Result<SnapshotId> {
    let next = ingestors
        .iter()
        .map(|service| service.ingest_snapshot_id())
        .max()
        .unwrap_or(0)
        + 1;
    let results = join_all(
        ingestors
            .iter()
            .map(|service| service.advance_ingest_snapshot_id(next)),
    )
    .await;
    for result in results {
        result?;
    }
    Ok(next)
}

/// Close a snapshot every `period` so stores keep committing even when
/// some queues see no traffic.
pub async fn advance_snapshots(
    ingestors: Vec<Arc<IngestService>>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match advance_once(&ingestors).await {
                    Ok(snapshot_id) => debug!(snapshot_id, "Advanced ingest snapshot"),
                    Err(e) => warn!("Failed to advance ingest snapshot: {}", e),
                }
            }
        }
    }
}

/// Drop WAL segments every store has consumed.
pub async fn recycle_once(
    log_service: &dyn LogService,
    tracker: &CommitTracker,
    queue_count: u32,
) -> usize {
    let mut removed = 0;
    for queue_id in 0..queue_count {
        let tail = tracker.tail_offset(queue_id);
        if tail == 0 {
            continue;
        }
        match log_service.delete_before(queue_id, tail + 1).await {
            Ok(count) => removed += count,
            Err(e) => warn!(queue_id, "WAL recycling failed: {}", e),
        }
    }
    if removed > 0 {
        info!(segments = removed, "Recycled WAL segments");
    }
    removed
}

pub async fn recycle_wal(
    log_service: Arc<dyn LogService>,
    tracker: Arc<CommitTracker>,
    queue_count: u32,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                recycle_once(log_service.as_ref(), tracker.as_ref(), queue_count).await;
            }
        }
    }
}
