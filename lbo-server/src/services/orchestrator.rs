//! Batch orchestrator façade
//!
//! Entry point used by the HTTP and WebSocket layers: creates batches,
//! reserves submitted items and hands them to the dispatcher, answers status
//! queries, and resumes unfinished batches after a restart.

use lbo_common::{Error, Result};
use std::sync::Arc;

use crate::db::BatchStore;
use crate::models::{BatchView, ItemSource, PendingItem, SourceKind, WorkItem};
use crate::services::dispatcher::ChunkDispatcher;
use crate::services::registry::ConnectionRegistry;

/// Accepted item submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub first_position: u64,
    pub accepted: usize,
}

/// What startup recovery resumed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub batches: usize,
    /// URL items handed back to the dispatcher
    pub redispatched: usize,
    /// Upload items recorded invalid because their bytes were not retained
    pub lost: usize,
}

#[derive(Clone)]
pub struct BatchOrchestrator {
    store: BatchStore,
    dispatcher: ChunkDispatcher,
    registry: Arc<ConnectionRegistry>,
}

impl BatchOrchestrator {
    pub fn new(store: BatchStore, dispatcher: ChunkDispatcher, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            store,
            dispatcher,
            registry,
        }
    }

    pub fn store(&self) -> &BatchStore {
        &self.store
    }

    pub fn dispatcher(&self) -> &ChunkDispatcher {
        &self.dispatcher
    }

    /// Create a batch and subscribe its owner to it
    pub async fn start_batch(&self, client_id: &str, total: u64) -> Result<String> {
        let batch_id = self.store.create(client_id, total).await?;
        self.registry.subscribe(client_id, &batch_id).await;
        Ok(batch_id)
    }

    /// Reserve positions for `items` and dispatch them in the background
    pub async fn submit_items(&self, batch_id: &str, items: Vec<ItemSource>) -> Result<Submission> {
        if items.is_empty() {
            return Err(Error::InvalidInput("no items submitted".to_string()));
        }

        let refs: Vec<(SourceKind, String)> = items
            .iter()
            .map(|source| (source.kind(), source.reference().to_string()))
            .collect();
        let first_position = self.store.reserve_items(batch_id, &refs).await?;

        let accepted = items.len();
        let work = items
            .into_iter()
            .enumerate()
            .map(|(offset, source)| WorkItem {
                position: first_position + offset as u64,
                source,
            })
            .collect();

        self.dispatcher.submit(batch_id.to_string(), work);

        tracing::info!(batch_id = %batch_id, first_position, accepted, "Items submitted");

        Ok(Submission {
            first_position,
            accepted,
        })
    }

    pub async fn get_status(&self, batch_id: &str) -> Result<BatchView> {
        self.store.get_status(batch_id).await
    }

    pub async fn get_status_with_results(&self, batch_id: &str) -> Result<BatchView> {
        self.store.get_status_with_results(batch_id).await
    }

    /// Attach `client_id` to an existing batch
    pub async fn subscribe(&self, client_id: &str, batch_id: &str) -> Result<()> {
        self.store.get_status(batch_id).await?;
        self.registry.subscribe(client_id, batch_id).await;
        Ok(())
    }

    /// Resume every unfinished batch found in the store
    ///
    /// Pending URL items are dispatched again; pending uploads are recorded as
    /// invalid. Every resumed batch is finalized once its run ends, including
    /// batches whose results were all recorded just before the restart.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for batch_id in self.store.active_batches().await? {
            let view = self.store.get_status(&batch_id).await?;
            self.registry.subscribe(&view.client_id, &batch_id).await;

            let (urls, lost): (Vec<PendingItem>, Vec<PendingItem>) = self
                .store
                .pending_items(&batch_id)
                .await?
                .into_iter()
                .partition(|item| item.kind == SourceKind::Url);

            let work: Vec<WorkItem> = urls
                .into_iter()
                .map(|item| WorkItem {
                    position: item.position,
                    source: ItemSource::Url(item.source_ref),
                })
                .collect();

            tracing::info!(
                batch_id = %batch_id,
                redispatched = work.len(),
                lost = lost.len(),
                processed = view.processed,
                total = view.total,
                "Resuming batch"
            );

            report.batches += 1;
            report.redispatched += work.len();
            report.lost += lost.len();

            self.dispatcher.submit_recovered(batch_id, work, lost);
        }

        Ok(report)
    }
}
