//! Batch store
//!
//! Durable batch records, reserved items and item results. Every mutation of a
//! batch runs under that batch's key lock and inside one SQLite transaction, so
//! counters and the result they account for land together or not at all.
//! Mutations publish their outcome on the [`EventBus`] after commit.

use chrono::{DateTime, Utc};
use lbo_common::events::{BatchEvent, EventBus};
use lbo_common::{BatchStatus, Error, ProgressCounts, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::models::{BatchView, BoundingBox, ItemResult, PendingItem, SourceKind, StoreOutcome};
use crate::utils::retry_on_lock;

/// Prune idle key locks once the map grows past this many entries
const LOCK_PRUNE_THRESHOLD: usize = 256;

// ========================================
// Key-scoped locking
// ========================================

/// One async mutex per batch id; different ids never contend
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            if locks.len() > LOCK_PRUNE_THRESHOLD {
                // Only the map holds it: nobody owns or waits on that lock
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

// ========================================
// Row mapping
// ========================================

const BATCH_COLUMNS: &str = "batch_id, client_id, total, submitted, processed, valid_count, \
     invalid_count, status, failure_reason, created_at, updated_at";

struct BatchRow {
    batch_id: String,
    client_id: String,
    counts: ProgressCounts,
    submitted: u64,
    status: BatchStatus,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl BatchRow {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        let status: String = row.get("status");
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");

        Ok(Self {
            batch_id: row.get("batch_id"),
            client_id: row.get("client_id"),
            counts: ProgressCounts {
                processed: row.get::<i64, _>("processed") as u64,
                total: row.get::<i64, _>("total") as u64,
                valid: row.get::<i64, _>("valid_count") as u64,
                invalid: row.get::<i64, _>("invalid_count") as u64,
            },
            submitted: row.get::<i64, _>("submitted") as u64,
            status: status.parse()?,
            failure_reason: row.get("failure_reason"),
            created_at: parse_timestamp(&created_at, "created_at")?,
            updated_at: parse_timestamp(&updated_at, "updated_at")?,
        })
    }

    fn outcome(&self, changed: bool) -> StoreOutcome {
        StoreOutcome {
            counts: self.counts,
            status: self.status,
            changed,
        }
    }

    fn into_view(self, results: Option<Vec<ItemResult>>) -> BatchView {
        BatchView {
            percentage: self.counts.percentage(),
            batch_id: self.batch_id,
            client_id: self.client_id,
            status: self.status,
            total: self.counts.total,
            submitted: self.submitted,
            processed: self.counts.processed,
            valid_count: self.counts.valid,
            invalid_count: self.counts.invalid,
            failure_reason: self.failure_reason,
            created_at: self.created_at,
            updated_at: self.updated_at,
            results,
        }
    }
}

fn parse_timestamp(value: &str, column: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", column, e)))
}

fn result_from_row(row: &SqliteRow) -> Result<ItemResult> {
    let bounding_box: Option<String> = row.get("bounding_box");
    let bounding_box = bounding_box
        .map(|json| serde_json::from_str::<BoundingBox>(&json))
        .transpose()?;

    Ok(ItemResult {
        position: row.get::<i64, _>("position") as u64,
        source_ref: row.get("source_ref"),
        valid: row.get::<i64, _>("valid") != 0,
        confidence: row.get("confidence"),
        model_used: row.get("model_used"),
        bounding_box,
        duration_ms: row.get::<i64, _>("duration_ms") as u64,
        error: row.get("error"),
    })
}

fn not_found(batch_id: &str) -> Error {
    Error::NotFound(format!("batch {}", batch_id))
}

async fn fetch_batch(conn: &mut SqliteConnection, batch_id: &str) -> Result<Option<BatchRow>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM batches WHERE batch_id = ?",
        BATCH_COLUMNS
    ))
    .bind(batch_id)
    .fetch_optional(conn)
    .await?;

    row.as_ref().map(BatchRow::from_row).transpose()
}

// ========================================
// Transaction bodies (retried as a whole on lock contention)
// ========================================

async fn apply_in_tx(pool: &SqlitePool, batch_id: &str, result: &ItemResult) -> Result<StoreOutcome> {
    let mut tx = pool.begin().await?;

    let batch = fetch_batch(&mut tx, batch_id)
        .await?
        .ok_or_else(|| not_found(batch_id))?;

    if batch.status.is_terminal() {
        return Ok(batch.outcome(false));
    }

    if result.position >= batch.counts.total {
        return Err(Error::InvalidInput(format!(
            "position {} out of range for batch {} (total {})",
            result.position, batch_id, batch.counts.total
        )));
    }

    let bounding_box = result
        .bounding_box
        .map(|b| serde_json::to_string(&b))
        .transpose()?;
    let now = Utc::now().to_rfc3339();

    let inserted = sqlx::query(
        r#"
        INSERT OR IGNORE INTO batch_results (
            batch_id, position, source_ref, valid, confidence, model_used,
            bounding_box, duration_ms, error, recorded_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(batch_id)
    .bind(result.position as i64)
    .bind(&result.source_ref)
    .bind(result.valid as i64)
    .bind(result.confidence)
    .bind(&result.model_used)
    .bind(&bounding_box)
    .bind(result.duration_ms as i64)
    .bind(&result.error)
    .bind(&now)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if inserted == 0 {
        // Position already has a result
        return Ok(batch.outcome(false));
    }

    let mut counts = batch.counts;
    counts.processed += 1;
    if result.valid {
        counts.valid += 1;
    } else {
        counts.invalid += 1;
    }
    let status = BatchStatus::Processing;

    sqlx::query(
        r#"
        UPDATE batches
        SET processed = ?, valid_count = ?, invalid_count = ?, status = ?, updated_at = ?
        WHERE batch_id = ?
        "#,
    )
    .bind(counts.processed as i64)
    .bind(counts.valid as i64)
    .bind(counts.invalid as i64)
    .bind(status.as_str())
    .bind(&now)
    .bind(batch_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(StoreOutcome {
        counts,
        status,
        changed: true,
    })
}

async fn transition_in_tx(
    pool: &SqlitePool,
    batch_id: &str,
    next: BatchStatus,
    reason: Option<&str>,
) -> Result<StoreOutcome> {
    let mut tx = pool.begin().await?;

    let batch = fetch_batch(&mut tx, batch_id)
        .await?
        .ok_or_else(|| not_found(batch_id))?;

    if !batch.status.can_transition_to(next) || batch.status == next {
        return Ok(batch.outcome(false));
    }

    if next == BatchStatus::Complete && !batch.counts.is_finished() {
        return Ok(batch.outcome(false));
    }

    sqlx::query(
        "UPDATE batches SET status = ?, failure_reason = ?, updated_at = ? WHERE batch_id = ?",
    )
    .bind(next.as_str())
    .bind(reason)
    .bind(Utc::now().to_rfc3339())
    .bind(batch_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(StoreOutcome {
        counts: batch.counts,
        status: next,
        changed: true,
    })
}

async fn reserve_in_tx(
    pool: &SqlitePool,
    batch_id: &str,
    items: &[(SourceKind, String)],
) -> Result<u64> {
    let mut tx = pool.begin().await?;

    let batch = fetch_batch(&mut tx, batch_id)
        .await?
        .ok_or_else(|| not_found(batch_id))?;

    if batch.status.is_terminal() {
        return Err(Error::Conflict(format!(
            "batch {} is {} and accepts no more items",
            batch_id, batch.status
        )));
    }

    let first_position = batch.submitted;
    let submitted = first_position + items.len() as u64;
    if submitted > batch.counts.total {
        return Err(Error::InvalidInput(format!(
            "submitting {} items would exceed batch total {} ({} already submitted)",
            items.len(),
            batch.counts.total,
            first_position
        )));
    }

    for (offset, (kind, source_ref)) in items.iter().enumerate() {
        sqlx::query(
            "INSERT INTO batch_items (batch_id, position, source_kind, source_ref) VALUES (?, ?, ?, ?)",
        )
        .bind(batch_id)
        .bind((first_position + offset as u64) as i64)
        .bind(kind.as_str())
        .bind(source_ref)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query("UPDATE batches SET submitted = ?, updated_at = ? WHERE batch_id = ?")
        .bind(submitted as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(first_position)
}

async fn delete_in_tx(pool: &SqlitePool, batch_id: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM batch_results WHERE batch_id = ?")
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM batch_items WHERE batch_id = ?")
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;
    let deleted = sqlx::query("DELETE FROM batches WHERE batch_id = ?")
        .bind(batch_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    tx.commit().await?;

    Ok(deleted > 0)
}

// ========================================
// BatchStore
// ========================================

/// Durable keyed record of batches and their item results
#[derive(Clone)]
pub struct BatchStore {
    pool: SqlitePool,
    events: EventBus,
    locks: Arc<KeyedLocks>,
    max_lock_wait_ms: u64,
}

impl BatchStore {
    pub fn new(pool: SqlitePool, events: EventBus, max_lock_wait_ms: u64) -> Self {
        Self {
            pool,
            events,
            locks: Arc::new(KeyedLocks::default()),
            max_lock_wait_ms,
        }
    }

    /// Bus carrying every committed mutation
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a PENDING batch owned by `client_id`
    pub async fn create(&self, client_id: &str, total: u64) -> Result<String> {
        if total == 0 {
            return Err(Error::InvalidInput(
                "batch total must be at least 1".to_string(),
            ));
        }
        if client_id.trim().is_empty() {
            return Err(Error::InvalidInput("client_id must not be empty".to_string()));
        }

        let batch_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        retry_on_lock("create_batch", self.max_lock_wait_ms, || async {
            sqlx::query(
                r#"
                INSERT INTO batches (batch_id, client_id, total, status, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&batch_id)
            .bind(client_id)
            .bind(total as i64)
            .bind(BatchStatus::Pending.as_str())
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await?;
            Ok::<(), Error>(())
        })
        .await?;

        tracing::info!(batch_id = %batch_id, client_id = %client_id, total, "Batch created");

        Ok(batch_id)
    }

    /// Record one item result and bump the counters
    ///
    /// Re-applying a position that already has a result, or applying against a
    /// COMPLETE/FAILED batch, is accepted and changes nothing.
    pub async fn apply_result(&self, batch_id: &str, result: &ItemResult) -> Result<StoreOutcome> {
        let _guard = self.locks.acquire(batch_id).await;

        let outcome = retry_on_lock("apply_result", self.max_lock_wait_ms, || {
            apply_in_tx(&self.pool, batch_id, result)
        })
        .await?;

        if outcome.changed {
            tracing::debug!(
                batch_id = %batch_id,
                position = result.position,
                valid = result.valid,
                processed = outcome.counts.processed,
                total = outcome.counts.total,
                "Item result applied"
            );
            // Emitted under the key lock so events leave in commit order
            self.events
                .emit_lossy(BatchEvent::progress(batch_id, outcome.counts));
        } else {
            tracing::debug!(
                batch_id = %batch_id,
                position = result.position,
                status = %outcome.status,
                "Item result ignored"
            );
        }

        Ok(outcome)
    }

    /// Move the batch to COMPLETE if every item has a result
    ///
    /// Returns `changed = false` while items are still outstanding, or when the
    /// batch is already terminal.
    pub async fn mark_finalized(&self, batch_id: &str) -> Result<StoreOutcome> {
        let _guard = self.locks.acquire(batch_id).await;

        let outcome = retry_on_lock("mark_finalized", self.max_lock_wait_ms, || {
            transition_in_tx(&self.pool, batch_id, BatchStatus::Complete, None)
        })
        .await?;

        if outcome.changed {
            tracing::info!(
                batch_id = %batch_id,
                valid = outcome.counts.valid,
                invalid = outcome.counts.invalid,
                total = outcome.counts.total,
                "Batch complete"
            );
            self.events
                .emit_lossy(BatchEvent::complete(batch_id, outcome.counts));
        }

        Ok(outcome)
    }

    /// Move a non-terminal batch to FAILED
    pub async fn mark_failed(&self, batch_id: &str, reason: &str) -> Result<StoreOutcome> {
        let _guard = self.locks.acquire(batch_id).await;

        let outcome = retry_on_lock("mark_failed", self.max_lock_wait_ms, || {
            transition_in_tx(&self.pool, batch_id, BatchStatus::Failed, Some(reason))
        })
        .await?;

        if outcome.changed {
            tracing::error!(batch_id = %batch_id, reason = %reason, "Batch failed");
            self.events.emit_lossy(BatchEvent::error(batch_id, reason));
        }

        Ok(outcome)
    }

    /// Assign contiguous positions to newly submitted items
    ///
    /// Returns the first assigned position.
    pub async fn reserve_items(&self, batch_id: &str, items: &[(SourceKind, String)]) -> Result<u64> {
        let _guard = self.locks.acquire(batch_id).await;

        let first_position = retry_on_lock("reserve_items", self.max_lock_wait_ms, || {
            reserve_in_tx(&self.pool, batch_id, items)
        })
        .await?;

        tracing::debug!(
            batch_id = %batch_id,
            first_position,
            count = items.len(),
            "Items reserved"
        );

        Ok(first_position)
    }

    /// Items that were reserved but have no result yet, in position order
    pub async fn pending_items(&self, batch_id: &str) -> Result<Vec<PendingItem>> {
        let rows = sqlx::query(
            r#"
            SELECT i.position, i.source_kind, i.source_ref
            FROM batch_items i
            LEFT JOIN batch_results r
                ON r.batch_id = i.batch_id AND r.position = i.position
            WHERE i.batch_id = ? AND r.position IS NULL
            ORDER BY i.position
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let kind: String = row.get("source_kind");
                Ok(PendingItem {
                    position: row.get::<i64, _>("position") as u64,
                    kind: kind.parse()?,
                    source_ref: row.get("source_ref"),
                })
            })
            .collect()
    }

    /// Ids of every PENDING or PROCESSING batch, oldest first
    pub async fn active_batches(&self) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT batch_id FROM batches
            WHERE status IN ('PENDING', 'PROCESSING')
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    /// Current state of a batch, or `Error::NotFound`
    pub async fn get_status(&self, batch_id: &str) -> Result<BatchView> {
        let mut conn = self.pool.acquire().await?;
        let batch = fetch_batch(&mut conn, batch_id)
            .await?
            .ok_or_else(|| not_found(batch_id))?;

        Ok(batch.into_view(None))
    }

    /// Current state plus every recorded item result
    pub async fn get_status_with_results(&self, batch_id: &str) -> Result<BatchView> {
        let mut view = self.get_status(batch_id).await?;
        view.results = Some(self.results(batch_id).await?);
        Ok(view)
    }

    /// Recorded item results in position order
    pub async fn results(&self, batch_id: &str) -> Result<Vec<ItemResult>> {
        let rows = sqlx::query(
            r#"
            SELECT position, source_ref, valid, confidence, model_used,
                   bounding_box, duration_ms, error
            FROM batch_results
            WHERE batch_id = ?
            ORDER BY position
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(result_from_row).collect()
    }

    /// Remove a batch with its items and results
    ///
    /// Later mutations against the id observe `Error::NotFound`.
    pub async fn delete(&self, batch_id: &str) -> Result<()> {
        let _guard = self.locks.acquire(batch_id).await;

        let deleted = retry_on_lock("delete_batch", self.max_lock_wait_ms, || {
            delete_in_tx(&self.pool, batch_id)
        })
        .await?;

        if !deleted {
            return Err(not_found(batch_id));
        }

        tracing::info!(batch_id = %batch_id, "Batch deleted");
        Ok(())
    }
}
