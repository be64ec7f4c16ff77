//! In-process delivery from the batch sender to writer agents.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use lattice_common::{Error, StoreDataBatch, StoreId, StoreWriter};

use crate::writer::WriterAgent;

/// Routes `write_store` calls to the writer agent registered for the store.
#[derive(Default)]
pub struct LocalStoreWriter {
    agents: DashMap<StoreId, Arc<WriterAgent>>,
}

impl LocalStoreWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, agent: Arc<WriterAgent>) {
        debug!(store_id = agent.store_id(), "Registered writer agent");
        self.agents.insert(agent.store_id(), agent);
    }
}

#[async_trait]
impl StoreWriter for LocalStoreWriter {
    async fn write_store(
        &self,
        store_id: StoreId,
        batches: Vec<StoreDataBatch>,
    ) -> lattice_common::Result<()> {
        let agent = self
            .agents
            .get(&store_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::Unavailable(format!("store {} has no writer agent", store_id)))?;

        // A retried call may re-offer batches accepted before the failure;
        // the agent skips offsets it has already consumed.
        for batch in batches {
            agent
                .write_store(batch)
                .map_err(|e| Error::Unavailable(format!("store {}: {}", store_id, e)))?;
        }
        Ok(())
    }
}
