//! Chunk dispatcher
//!
//! Fire-and-forget execution of submitted items: ordered chunks, a pacing delay
//! before every chunk after the first, and concurrent classification inside a
//! chunk under one global permit pool shared by every batch.
//!
//! Item failures are retried up to `RetryPolicy::max_attempts` and then recorded
//! as invalid results carrying the last error, so every item produces exactly one
//! result and the batch always reaches COMPLETE. Only a store fault fails a batch.
//!
//! Cancellation stops runs between chunks, during pacing, or mid-chunk; items
//! without a result stay pending in the store and are resumed by startup recovery.

use futures::future::join_all;
use lbo_common::config::{DispatchConfig, PacingConfig};
use lbo_common::{Error, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::db::BatchStore;
use crate::models::{ItemResult, PendingItem, WorkItem};
use crate::services::classifier::{ClassifyError, Classifier};
use crate::services::pacing::PacingPolicy;

/// Error detail recorded for upload items whose bytes did not survive a restart
pub const LOST_PAYLOAD_ERROR: &str = "payload lost across restart";

/// Per-item retry bound
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Pause before retry `n` is `backoff[n - 1]`; the last entry repeats, empty means none
    pub backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Pause after failed attempt `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff
            .get(index)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

/// Dispatcher tuning
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub chunk_size: usize,
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    pub classify_timeout: Duration,
    pub pacing: PacingPolicy,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default(), &PacingConfig::default())
    }
}

impl DispatchSettings {
    pub fn from_config(dispatch: &DispatchConfig, pacing: &PacingConfig) -> Self {
        Self {
            chunk_size: dispatch.chunk_size.max(1),
            max_concurrency: dispatch
                .max_concurrency
                .unwrap_or_else(default_concurrency)
                .max(1),
            retry: RetryPolicy {
                max_attempts: dispatch.item_max_attempts.max(1),
                backoff: dispatch
                    .item_backoff_ms
                    .iter()
                    .map(|ms| Duration::from_millis(*ms))
                    .collect(),
            },
            classify_timeout: Duration::from_secs(dispatch.classify_timeout_secs),
            pacing: PacingPolicy::from_config(pacing),
        }
    }
}

/// `min(4, available parallelism)`
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(4)
}

/// Runs submitted items against the classifier and records their results
#[derive(Clone)]
pub struct ChunkDispatcher {
    store: BatchStore,
    classifier: Arc<dyn Classifier>,
    permits: Arc<Semaphore>,
    settings: Arc<DispatchSettings>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl ChunkDispatcher {
    pub fn new(store: BatchStore, classifier: Arc<dyn Classifier>, settings: DispatchSettings) -> Self {
        tracing::info!(
            chunk_size = settings.chunk_size,
            max_concurrency = settings.max_concurrency,
            max_attempts = settings.retry.max_attempts,
            "Chunk dispatcher initialized"
        );

        Self {
            store,
            classifier,
            permits: Arc::new(Semaphore::new(settings.max_concurrency)),
            settings: Arc::new(settings),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Stop runs when `cancel` fires instead of carrying them to completion
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Start processing `items` in the background and return immediately
    pub fn submit(&self, batch_id: String, items: Vec<WorkItem>) {
        self.submit_recovered(batch_id, items, Vec::new());
    }

    /// Like [`submit`](Self::submit), also recording `lost` items as invalid
    pub fn submit_recovered(&self, batch_id: String, items: Vec<WorkItem>, lost: Vec<PendingItem>) {
        let dispatcher = self.clone();
        self.tracker
            .spawn(async move { dispatcher.run_batch(batch_id, items, lost).await });
    }

    /// Number of batch runs still in progress
    pub fn active_runs(&self) -> usize {
        self.tracker.len()
    }

    /// Wait until every run submitted so far has finished
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    async fn run_batch(self, batch_id: String, items: Vec<WorkItem>, lost: Vec<PendingItem>) {
        // Pacing follows the declared batch size, not this submission's share of it
        let batch_size = match self.store.get_status(&batch_id).await {
            Ok(view) => view.total,
            Err(e) => {
                self.abort(&batch_id, e).await;
                return;
            }
        };
        let chunk_size = self.settings.chunk_size;
        let total_chunks = items.len().div_ceil(chunk_size) as u64;

        tracing::info!(
            batch_id = %batch_id,
            items = items.len(),
            batch_size,
            lost = lost.len(),
            chunks = total_chunks,
            "Dispatching batch"
        );

        for item in &lost {
            let result = ItemResult::failed(item.position, &item.source_ref, LOST_PAYLOAD_ERROR, 0);
            if let Err(e) = self.store.apply_result(&batch_id, &result).await {
                self.abort(&batch_id, e).await;
                return;
            }
        }

        for (index, chunk) in items.chunks(chunk_size).enumerate() {
            let index = index as u64;
            if index > 0 {
                let pause = self.settings.pacing.delay(batch_size, index, total_chunks);
                tracing::debug!(
                    batch_id = %batch_id,
                    chunk = index,
                    delay_ms = pause.as_millis() as u64,
                    "Pacing before chunk"
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        self.log_interrupted(&batch_id, index);
                        return;
                    }
                    _ = tokio::time::sleep(pause) => {}
                }
            }

            let chunk_run = join_all(chunk.iter().map(|item| self.process_item(&batch_id, item)));
            let outcomes = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.log_interrupted(&batch_id, index);
                    return;
                }
                outcomes = chunk_run => outcomes,
            };

            if let Some(err) = outcomes.into_iter().find_map(|r| r.err()) {
                self.abort(&batch_id, err).await;
                return;
            }
        }

        match self.store.mark_finalized(&batch_id).await {
            Ok(outcome) if !outcome.changed => {
                tracing::debug!(
                    batch_id = %batch_id,
                    processed = outcome.counts.processed,
                    total = outcome.counts.total,
                    "Dispatch run finished, batch still has outstanding items"
                );
            }
            Ok(_) => {}
            Err(e) => self.abort(&batch_id, e).await,
        }
    }

    fn log_interrupted(&self, batch_id: &str, chunk: u64) {
        tracing::info!(
            batch_id = %batch_id,
            chunk,
            "Dispatch interrupted by shutdown, unfinished items stay pending"
        );
    }

    /// Stop dispatching a batch after a store error
    async fn abort(&self, batch_id: &str, err: Error) {
        if err.is_not_found() {
            tracing::info!(batch_id = %batch_id, "Batch disappeared during dispatch, stopping");
            return;
        }

        tracing::error!(batch_id = %batch_id, error = %err, "Store fault during dispatch");
        if let Err(e) = self.store.mark_failed(batch_id, &err.to_string()).await {
            tracing::error!(batch_id = %batch_id, error = %e, "Failed to mark batch as failed");
        }
    }

    /// Classify one item (with retries) and record its result
    async fn process_item(&self, batch_id: &str, item: &WorkItem) -> Result<()> {
        let retry = &self.settings.retry;
        let started = Instant::now();
        let mut last_error = String::new();
        let mut verdict = None;

        for attempt in 1..=retry.max_attempts {
            let outcome = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| Error::Internal("classifier pool closed".to_string()))?;
                tokio::time::timeout(
                    self.settings.classify_timeout,
                    self.classifier.classify(&item.source),
                )
                .await
                .unwrap_or(Err(ClassifyError::Timeout(self.settings.classify_timeout)))
            };

            match outcome {
                Ok(classification) => {
                    verdict = Some(classification);
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        batch_id = %batch_id,
                        position = item.position,
                        attempt,
                        max_attempts = retry.max_attempts,
                        error = %e,
                        "Classification attempt failed"
                    );
                    last_error = e.to_string();
                }
            }

            if attempt < retry.max_attempts {
                let pause = retry.backoff_for(attempt);
                if !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let source_ref = item.source.reference();
        let result = match verdict {
            Some(classification) => {
                ItemResult::classified(item.position, source_ref, classification, duration_ms)
            }
            None => ItemResult::failed(
                item.position,
                source_ref,
                format!(
                    "classification failed after {} attempts: {}",
                    retry.max_attempts, last_error
                ),
                duration_ms,
            ),
        };

        self.store.apply_result(batch_id, &result).await?;
        Ok(())
    }
}
