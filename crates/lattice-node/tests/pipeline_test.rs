//! End-to-end: ingest through the WAL, deliver, apply, commit, back up.

use std::time::Duration;

use lattice_common::{MetaService, OperationBatch, OperationBlob, OperationKind};
use lattice_config::ClusterConfig;
use lattice_ingest::QueueState;
use lattice_node::{tasks, Node, NodeConfig};
use lattice_store::RESTORE_FILE_NAME;
use tempfile::TempDir;

/// Two stores, one ingestor, two queues, four partitions. Snapshots are
/// advanced by the tests themselves.
fn config(dir: &TempDir) -> NodeConfig {
    let mut config = NodeConfig {
        cluster: ClusterConfig {
            node_index: 0,
            store_count: 2,
            ingestor_count: 1,
            queue_count: 2,
            partition_count: 4,
        },
        ..NodeConfig::default()
    };
    config.wal.data_dir = dir.path().join("wal");
    config.wal.segment_size = 64;
    config.wal.fsync = false;
    config.ingest.snapshot_increase_interval_ms = 3_600_000;
    config.ingest.send_retry_initial_ms = 1;
    config.ingest.send_retry_max_ms = 10;
    config.store.commit_interval_ms = 20;
    config.store.poll_timeout_ms = 10;
    config.backup.enable = true;
    config.backup.thread_count = 2;
    config.recycler.enable = false;
    config
}

fn vertex(key: u64) -> OperationBatch {
    OperationBatch::new(vec![OperationBlob::new(
        OperationKind::OverwriteVertex,
        key,
        format!("vertex-{}", key),
    )])
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn running_node(dir: &TempDir) -> Node {
    let node = Node::start(config(dir)).await.unwrap();
    assert!(
        eventually(|| {
            let states = node.queue_states();
            states.len() == 2 && states.values().all(|s| *s == QueueState::Running)
        })
        .await
    );
    node
}

/// Ingest keys 0..4 spread over both queues and make them visible.
async fn ingest_and_publish(node: &Node) {
    for key in 0..4u64 {
        let snapshot_id = node.ingest((key % 2) as u32, vertex(key)).await.unwrap();
        assert_eq!(snapshot_id, 0);
    }
    // The first marker closes snapshot 0; the second lets stores report it.
    assert_eq!(node.advance_snapshot().await.unwrap(), 1);
    assert_eq!(node.advance_snapshot().await.unwrap(), 2);
    assert!(eventually(|| node.query_snapshot_id() >= 1).await);
}

#[tokio::test]
async fn test_ingested_data_reaches_owning_partitions() {
    let dir = TempDir::new().unwrap();
    let node = running_node(&dir).await;
    ingest_and_publish(&node).await;

    for key in 0..4u64 {
        let partition_id = key as i32;
        let store = node.store(partition_id as u32 % 2).unwrap();
        let operations = store.partition(partition_id).unwrap().operations();
        assert_eq!(operations.len(), 1);
        assert_eq!(operations[0].partition_key, Some(key));
        assert_eq!(operations[0].snapshot_id, 0);
    }

    let committed = node.commit_tracker().committed(0).unwrap();
    assert!(committed.snapshot_id >= 1);
    assert_eq!(committed.ddl_snapshot_id, 0);
    assert!(node.writer_agent(1).unwrap().available_snapshot().snapshot_id >= 1);

    node.shutdown().await;
}

#[tokio::test]
async fn test_store_backup_and_restore() {
    let dir = TempDir::new().unwrap();
    let node = running_node(&dir).await;
    ingest_and_publish(&node).await;

    let agent = node.backup_agent(0).unwrap();
    let backup_id = agent.create_new_store_backup(9).await.unwrap();
    assert_eq!(backup_id.global_backup_id(), 9);
    assert_eq!(
        backup_id.partition_backup_ids().keys().copied().collect::<Vec<_>>(),
        vec![0, 2]
    );
    agent.verify_store_backup(&backup_id).await.unwrap();

    let restore_root = dir.path().join("restore");
    agent
        .restore_from_store_backup(&backup_id, &restore_root)
        .await
        .unwrap();
    for partition_id in [0, 2] {
        assert!(restore_root
            .join(partition_id.to_string())
            .join(RESTORE_FILE_NAME)
            .exists());
    }

    node.shutdown().await;
}

#[tokio::test]
async fn test_consumed_wal_segments_are_recycled() {
    let dir = TempDir::new().unwrap();
    let node = running_node(&dir).await;
    ingest_and_publish(&node).await;

    // Every record gets its own segment at this segment size.
    let queue_count = node.meta().queue_count();
    let mut removed = 0;
    for _ in 0..100 {
        removed = tasks::recycle_once(
            node.log_service().as_ref(),
            node.commit_tracker(),
            queue_count,
        )
        .await;
        if removed > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(removed > 0);

    // Ingestion continues on the truncated log.
    assert_eq!(node.ingest(0, vertex(8)).await.unwrap(), 2);
    node.shutdown().await;
}
