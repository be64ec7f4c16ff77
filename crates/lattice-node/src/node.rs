//! In-process assembly of a whole lattice cluster.
//!
//! Every store runs a [`MemoryStore`] behind its own [`WriterAgent`]; every
//! ingestor index runs an [`IngestService`] over a shared file WAL. The
//! pieces talk through the same collaborator traits a distributed
//! deployment would put an RPC layer behind.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use lattice_backup::BackupAgent;
use lattice_common::{
    LocalDiscovery, MetaService, NodeInfo, NodeRole, OperationBatch, QueueId, SnapshotId,
    StaticMetaService, StoreId,
};
use lattice_ingest::{BatchSender, IngestCollaborators, IngestService, QueueState};
use lattice_store::{CommitTracker, LocalStoreWriter, MemoryStore, WriterAgent};
use lattice_wal::{FileLogService, LogService};

use crate::config::NodeConfig;
use crate::tasks;

pub struct Node {
    config: NodeConfig,
    meta: Arc<StaticMetaService>,
    stores: Vec<Arc<MemoryStore>>,
    agents: Vec<Arc<WriterAgent>>,
    backup_agents: Vec<BackupAgent>,
    tracker: Arc<CommitTracker>,
    sender: Arc<BatchSender>,
    discovery: Arc<LocalDiscovery>,
    ingestors: Vec<Arc<IngestService>>,
    log_service: Arc<dyn LogService>,
    cancel: CancellationToken,
    background: Vec<JoinHandle<()>>,
}

impl Node {
    /// Build and start every component. Stores announce themselves once
    /// their writer agents run, which releases the ingest processors.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let cluster = &config.cluster;
        let meta = Arc::new(StaticMetaService::new(
            cluster.store_count,
            cluster.ingestor_count,
            cluster.queue_count,
            cluster.partition_count,
        ));
        let tracker = Arc::new(CommitTracker::new(meta.store_count()));
        let store_writer = Arc::new(LocalStoreWriter::new());

        let mut stores = Vec::new();
        let mut agents = Vec::new();
        let mut backup_agents = Vec::new();
        for store_id in 0..meta.store_count() {
            let store = Arc::new(MemoryStore::for_store(store_id, meta.as_ref()));
            let agent = Arc::new(WriterAgent::new(
                store_id,
                meta.queue_count() as usize,
                config.store.clone(),
                store.clone(),
                tracker.clone(),
            ));
            agent.init(0);
            agent
                .start()
                .with_context(|| format!("failed to start writer agent of store {}", store_id))?;
            store_writer.register(agent.clone());
            backup_agents.push(BackupAgent::new(config.backup.clone(), store.clone()));
            stores.push(store);
            agents.push(agent);
        }

        let sender = Arc::new(BatchSender::new(
            meta.clone(),
            store_writer,
            &config.ingest,
        ));
        let log_service: Arc<dyn LogService> = Arc::new(
            FileLogService::new(config.wal.clone())
                .await
                .context("failed to open WAL")?,
        );
        let discovery = Arc::new(LocalDiscovery::new());

        let deps = IngestCollaborators {
            meta: meta.clone(),
            log_service: log_service.clone(),
            sender: sender.clone(),
            progress: tracker.clone(),
            discovery: discovery.clone(),
        };
        let mut ingestors = Vec::new();
        for node_index in 0..cluster.ingestor_count {
            let service = Arc::new(IngestService::new(
                node_index,
                config.ingest.clone(),
                deps.clone(),
            ));
            service.start().await?;
            ingestors.push(service);
        }

        let store_nodes: Vec<NodeInfo> = (0..meta.store_count())
            .map(|store_id| NodeInfo::new(NodeRole::Store, store_id))
            .collect();
        discovery.join(&store_nodes);

        let cancel = CancellationToken::new();
        let mut background = vec![tokio::spawn(tasks::advance_snapshots(
            ingestors.clone(),
            config.ingest.snapshot_increase_interval(),
            cancel.clone(),
        ))];
        if config.recycler.enable {
            background.push(tokio::spawn(tasks::recycle_wal(
                log_service.clone(),
                tracker.clone(),
                meta.queue_count(),
                config.recycler.interval(),
                cancel.clone(),
            )));
        }

        info!(
            stores = meta.store_count(),
            ingestors = cluster.ingestor_count,
            queues = meta.queue_count(),
            partitions = meta.partition_count(),
            "Node started"
        );

        Ok(Self {
            config,
            meta,
            stores,
            agents,
            backup_agents,
            tracker,
            sender,
            discovery,
            ingestors,
            log_service,
            cancel,
            background,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn meta(&self) -> &Arc<StaticMetaService> {
        &self.meta
    }

    /// Ingest `batch` on `queue_id` under a fresh request id.
    pub async fn ingest(&self, queue_id: QueueId, batch: OperationBatch) -> Result<SnapshotId> {
        let request_id = Uuid::new_v4().to_string();
        let service = self
            .ingestors
            .iter()
            .find(|service| service.queue_state(queue_id) != QueueState::Unassigned)
            .ok_or_else(|| anyhow!("queue {} is not assigned to any ingestor", queue_id))?;
        Ok(service.ingest_batch(request_id, queue_id, batch).await?)
    }

    /// Close the current snapshot on every queue.
    pub async fn advance_snapshot(&self) -> Result<SnapshotId> {
        Ok(tasks::advance_once(&self.ingestors).await?)
    }

    pub fn queue_states(&self) -> BTreeMap<QueueId, QueueState> {
        self.ingestors
            .iter()
            .flat_map(|service| service.queue_states())
            .collect()
    }

    /// Snapshot applied on every store.
    pub fn query_snapshot_id(&self) -> SnapshotId {
        self.tracker.query_snapshot_id()
    }

    pub fn store(&self, store_id: StoreId) -> Option<&Arc<MemoryStore>> {
        self.stores.get(store_id as usize)
    }

    pub fn writer_agent(&self, store_id: StoreId) -> Option<&Arc<WriterAgent>> {
        self.agents.get(store_id as usize)
    }

    pub fn backup_agent(&self, store_id: StoreId) -> Option<&BackupAgent> {
        self.backup_agents.get(store_id as usize)
    }

    pub fn commit_tracker(&self) -> &Arc<CommitTracker> {
        &self.tracker
    }

    pub fn discovery(&self) -> &Arc<LocalDiscovery> {
        &self.discovery
    }

    pub fn log_service(&self) -> &Arc<dyn LogService> {
        &self.log_service
    }

    /// Stop ingestion first, then delivery, then apply.
    pub async fn shutdown(self) {
        info!("Shutting down node");
        self.cancel.cancel();
        for handle in self.background {
            let _ = handle.await;
        }
        for service in &self.ingestors {
            service.stop().await;
        }
        self.sender.stop().await;
        for agent in &self.agents {
            agent.stop().await;
        }
        info!("Node stopped");
    }
}
