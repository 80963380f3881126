//! Public view of a batch record

use chrono::{DateTime, Utc};
use lbo_common::events::BatchEvent;
use lbo_common::{BatchStatus, ProgressCounts};
use serde::Serialize;

use crate::models::ItemResult;

/// Status query answer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchView {
    pub batch_id: String,
    pub client_id: String,
    pub status: BatchStatus,
    pub total: u64,
    /// Items handed to the dispatcher so far
    pub submitted: u64,
    pub processed: u64,
    pub valid_count: u64,
    pub invalid_count: u64,
    pub percentage: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<ItemResult>>,
}

impl BatchView {
    pub fn counts(&self) -> ProgressCounts {
        ProgressCounts {
            processed: self.processed,
            total: self.total,
            valid: self.valid_count,
            invalid: self.invalid_count,
        }
    }

    /// The event that describes this batch's current state in full
    pub fn current_event(&self) -> BatchEvent {
        match self.status {
            BatchStatus::Complete => BatchEvent::complete(&self.batch_id, self.counts()),
            BatchStatus::Failed => BatchEvent::error(
                &self.batch_id,
                self.failure_reason
                    .clone()
                    .unwrap_or_else(|| "batch failed".to_string()),
            ),
            BatchStatus::Pending | BatchStatus::Processing => {
                BatchEvent::progress(&self.batch_id, self.counts())
            }
        }
    }
}

/// Result of a store mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOutcome {
    pub counts: ProgressCounts,
    pub status: BatchStatus,
    /// False when the call was idempotently ignored
    pub changed: bool,
}
