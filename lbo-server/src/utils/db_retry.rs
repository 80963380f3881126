//! Backoff for SQLite lock contention
//!
//! SQLITE_BUSY can still surface past the pool's busy_timeout. Per-batch
//! writes are already serialized in-process; this covers writers for different
//! batches colliding on the database file.

use lbo_common::{Error, Result};
use std::time::{Duration, Instant};

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(1000);

/// Sleep before retry number `retry` (1-based): 10ms doubling, capped at 1s
fn backoff_for(retry: u32) -> Duration {
    INITIAL_BACKOFF
        .saturating_mul(1u32 << retry.saturating_sub(1).min(10))
        .min(MAX_BACKOFF)
}

/// Run `operation` until it succeeds, fails with something other than lock
/// contention, or `max_wait_ms` has passed since the first attempt.
///
/// Lock contention past the deadline surfaces as [`Error::Internal`] so
/// callers see one error shape for "gave up waiting".
pub async fn retry_on_lock<F, Fut, T>(
    operation_name: &str,
    max_wait_ms: u64,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let started = Instant::now();
    let deadline = Duration::from_millis(max_wait_ms);
    let mut retries = 0u32;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if retries > 0 {
                    tracing::debug!(
                        operation = operation_name,
                        retries,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "Store write went through after lock contention"
                    );
                }
                return Ok(value);
            }
            Err(err) if err.is_lock_contention() => err,
            Err(err) => return Err(err),
        };

        let waited = started.elapsed();
        if waited >= deadline {
            tracing::error!(
                operation = operation_name,
                retries,
                waited_ms = waited.as_millis() as u64,
                error = %err,
                "Giving up on locked database"
            );
            return Err(Error::Internal(format!(
                "{}: database still locked after {} ms",
                operation_name,
                waited.as_millis()
            )));
        }

        retries += 1;
        let pause = backoff_for(retries);
        tracing::warn!(
            operation = operation_name,
            retries,
            pause_ms = pause.as_millis() as u64,
            "Database locked, backing off"
        );
        tokio::time::sleep(pause).await;
    }
}
