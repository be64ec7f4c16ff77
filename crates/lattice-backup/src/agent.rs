//! Backup agent: one store-wide backup over N partition backup engines.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use lattice_common::{BackupId, PartitionId, StoreBackupId};
use lattice_store::{GraphPartition, PartitionBackupEngine, StoreService};

use crate::config::BackupConfig;
use crate::{BackupError, Result};

pub struct BackupAgent {
    config: BackupConfig,
    store: Arc<dyn StoreService>,
    permits: Arc<Semaphore>,
}

impl BackupAgent {
    pub fn new(config: BackupConfig, store: Arc<dyn StoreService>) -> Self {
        let permits = Arc::new(Semaphore::new(config.thread_count.max(1)));
        Self {
            config,
            store,
            permits,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enable
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.config.enable {
            Ok(())
        } else {
            Err(BackupError::Disabled)
        }
    }

    /// Back up every local partition under `global_backup_id`. Partition
    /// backups created before a failure are left in place; callers remove
    /// them with [`clear_unavailable_store_backups`](Self::clear_unavailable_store_backups).
    pub async fn create_new_store_backup(&self, global_backup_id: BackupId) -> Result<StoreBackupId> {
        self.ensure_enabled()?;
        let targets = self
            .store
            .id_to_partition()
            .into_iter()
            .map(|(pid, partition)| (pid, partition, ()))
            .collect();

        let partition_backup_ids = self
            .fan_out(targets, |engine, ()| engine.create_new_partition_backup())
            .await
            .map_err(|e| {
                warn!(global_backup_id, "Store backup creation failed: {}", e);
                e
            })?;

        info!(
            global_backup_id,
            partitions = partition_backup_ids.len(),
            "Created store backup"
        );
        Ok(StoreBackupId::new(global_backup_id, partition_backup_ids))
    }

    /// Verify the partition backup of every entry in `backup_id`.
    pub async fn verify_store_backup(&self, backup_id: &StoreBackupId) -> Result<()> {
        self.ensure_enabled()?;
        let targets = self.resolve(backup_id.partition_backup_ids(), |id| *id)?;
        self.fan_out(targets, |engine, id| engine.verify_partition_backup(id))
            .await?;
        debug!(
            global_backup_id = backup_id.global_backup_id(),
            "Verified store backup"
        );
        Ok(())
    }

    /// Garbage-collect, on every local partition, each backup not listed in
    /// that partition's ready list. A partition without a list keeps nothing.
    pub async fn clear_unavailable_store_backups(
        &self,
        ready_partition_backup_ids: &BTreeMap<PartitionId, Vec<BackupId>>,
    ) -> Result<()> {
        self.ensure_enabled()?;
        let targets = self
            .store
            .id_to_partition()
            .into_iter()
            .map(|(pid, partition)| {
                let keep = ready_partition_backup_ids
                    .get(&pid)
                    .cloned()
                    .unwrap_or_default();
                (pid, partition, keep)
            })
            .collect();

        self.fan_out(targets, |engine, keep: Vec<BackupId>| {
            engine.partition_backup_gc(&keep)
        })
        .await?;
        info!("Cleared unavailable store backups");
        Ok(())
    }

    /// Restore every partition of `backup_id` into `restore_root/<partition_id>`.
    pub async fn restore_from_store_backup(
        &self,
        backup_id: &StoreBackupId,
        restore_root: &Path,
    ) -> Result<()> {
        self.ensure_enabled()?;
        let targets = self.resolve(backup_id.partition_backup_ids(), |id| *id)?;
        let targets = targets
            .into_iter()
            .map(|(pid, partition, id)| (pid, partition, (id, restore_root.join(pid.to_string()))))
            .collect();

        self.fan_out(targets, |engine, (id, path): (BackupId, PathBuf)| {
            engine.restore_from_partition_backup(id, &path)
        })
        .await?;
        info!(
            global_backup_id = backup_id.global_backup_id(),
            root = %restore_root.display(),
            "Restored store backup"
        );
        Ok(())
    }

    /// Pair every requested partition with its local handle.
    fn resolve<V, A>(
        &self,
        requested: &BTreeMap<PartitionId, V>,
        arg: impl Fn(&V) -> A,
    ) -> Result<Vec<(PartitionId, Arc<dyn GraphPartition>, A)>> {
        let mut partitions: HashMap<PartitionId, Arc<dyn GraphPartition>> =
            self.store.id_to_partition();
        requested
            .iter()
            .map(|(pid, value)| {
                partitions
                    .remove(pid)
                    .map(|partition| (*pid, partition, arg(value)))
                    .ok_or(BackupError::PartitionNotFound(*pid))
            })
            .collect()
    }

    /// Run `op` against the backup engine of every target on the worker
    /// pool. Returns on the first failure; tasks still pending are aborted.
    async fn fan_out<A, T, F>(
        &self,
        targets: Vec<(PartitionId, Arc<dyn GraphPartition>, A)>,
        op: F,
    ) -> Result<BTreeMap<PartitionId, T>>
    where
        A: Send + 'static,
        T: Send + 'static,
        F: Fn(&dyn PartitionBackupEngine, A) -> lattice_store::Result<T> + Send + Sync + 'static,
    {
        let op = Arc::new(op);
        let mut tasks = JoinSet::new();
        for (partition_id, partition, arg) in targets {
            let permits = self.permits.clone();
            let op = op.clone();
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| BackupError::Internal("backup worker pool closed".to_string()))?;
                let result = tokio::task::spawn_blocking(move || {
                    let engine = partition.open_backup_engine()?;
                    op(engine.as_ref(), arg)
                })
                .await
                .map_err(|e| BackupError::Internal(e.to_string()))?;
                result
                    .map(|value| (partition_id, value))
                    .map_err(|source| BackupError::Partition {
                        partition_id,
                        source,
                    })
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (partition_id, value) =
                joined.map_err(|e| BackupError::Internal(e.to_string()))??;
            results.insert(partition_id, value);
        }
        Ok(results)
    }
}
