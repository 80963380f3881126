//! Batch store integration tests
//!
//! Counter invariants, idempotent result application, state machine and
//! crash consistency against a file-backed database.

mod helpers;

use helpers::memory_store;
use lbo_common::events::BatchEvent;
use lbo_common::{BatchStatus, Error};
use lbo_server::db::{self, BatchStore};
use lbo_server::models::{Classification, ItemResult, SourceKind};
use lbo_common::events::EventBus;

fn valid(position: u64) -> ItemResult {
    ItemResult::classified(
        position,
        format!("img-{}.jpg", position),
        Classification::valid(0.9, "yolov8s"),
        12,
    )
}

fn invalid(position: u64) -> ItemResult {
    ItemResult::failed(position, format!("img-{}.jpg", position), "timed out", 60_000)
}

#[tokio::test]
async fn test_create_starts_pending() {
    let store = memory_store().await;
    let batch_id = store.create("alice", 3).await.unwrap();

    let view = store.get_status(&batch_id).await.unwrap();
    assert_eq!(view.status, BatchStatus::Pending);
    assert_eq!(view.client_id, "alice");
    assert_eq!((view.total, view.processed, view.valid_count, view.invalid_count), (3, 0, 0, 0));
    assert_eq!(view.percentage, 0.0);
}

#[tokio::test]
async fn test_create_rejects_empty_batch() {
    let store = memory_store().await;
    let err = store.create("alice", 0).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn test_unknown_batch_is_not_found() {
    let store = memory_store().await;

    assert!(store.get_status("no-such-batch").await.unwrap_err().is_not_found());
    assert!(store
        .apply_result("no-such-batch", &valid(0))
        .await
        .unwrap_err()
        .is_not_found());
    assert!(store.mark_finalized("no-such-batch").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_apply_same_result_twice_counts_once() {
    let store = memory_store().await;
    let batch_id = store.create("alice", 4).await.unwrap();

    let first = store.apply_result(&batch_id, &valid(2)).await.unwrap();
    assert!(first.changed);
    assert_eq!(first.status, BatchStatus::Processing);

    let second = store.apply_result(&batch_id, &valid(2)).await.unwrap();
    assert!(!second.changed);

    let view = store.get_status(&batch_id).await.unwrap();
    assert_eq!(view.processed, 1);
    assert_eq!(view.valid_count, 1);
    assert_eq!(store.results(&batch_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_counters_stay_consistent() {
    let store = memory_store().await;
    let batch_id = store.create("alice", 5).await.unwrap();

    for (position, result) in [valid(0), invalid(1), valid(2), invalid(3)].iter().enumerate() {
        let outcome = store.apply_result(&batch_id, result).await.unwrap();
        assert!(outcome.counts.is_consistent());
        assert_eq!(outcome.counts.processed, position as u64 + 1);
    }

    let view = store.get_status(&batch_id).await.unwrap();
    assert_eq!(view.processed, view.valid_count + view.invalid_count);
    assert_eq!((view.valid_count, view.invalid_count), (2, 2));
    assert_eq!(view.percentage, 80.0);
}

#[tokio::test]
async fn test_position_out_of_range_rejected() {
    let store = memory_store().await;
    let batch_id = store.create("alice", 2).await.unwrap();

    let err = store.apply_result(&batch_id, &valid(2)).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert_eq!(store.get_status(&batch_id).await.unwrap().processed, 0);
}

#[tokio::test]
async fn test_finalize_waits_for_every_item() {
    let store = memory_store().await;
    let batch_id = store.create("alice", 2).await.unwrap();
    store.apply_result(&batch_id, &valid(0)).await.unwrap();

    let early = store.mark_finalized(&batch_id).await.unwrap();
    assert!(!early.changed);
    assert_eq!(early.status, BatchStatus::Processing);

    store.apply_result(&batch_id, &invalid(1)).await.unwrap();
    let done = store.mark_finalized(&batch_id).await.unwrap();
    assert!(done.changed);
    assert_eq!(done.status, BatchStatus::Complete);
}

#[tokio::test]
async fn test_status_never_regresses() {
    let store = memory_store().await;
    let batch_id = store.create("alice", 1).await.unwrap();
    store.apply_result(&batch_id, &valid(0)).await.unwrap();
    store.mark_finalized(&batch_id).await.unwrap();

    // Terminal batch: further writes are accepted and ignored
    let late = store.apply_result(&batch_id, &invalid(0)).await.unwrap();
    assert!(!late.changed);
    assert_eq!(late.status, BatchStatus::Complete);

    let failed = store.mark_failed(&batch_id, "disk on fire").await.unwrap();
    assert!(!failed.changed);

    let view = store.get_status(&batch_id).await.unwrap();
    assert_eq!(view.status, BatchStatus::Complete);
    assert_eq!(view.valid_count, 1);
    assert!(view.failure_reason.is_none());
}

#[tokio::test]
async fn test_mark_failed_records_reason() {
    let store = memory_store().await;
    let batch_id = store.create("alice", 3).await.unwrap();
    store.apply_result(&batch_id, &valid(0)).await.unwrap();

    let outcome = store.mark_failed(&batch_id, "store fault").await.unwrap();
    assert!(outcome.changed);
    assert_eq!(outcome.status, BatchStatus::Failed);

    let view = store.get_status(&batch_id).await.unwrap();
    assert_eq!(view.failure_reason.as_deref(), Some("store fault"));
    assert!(!store.apply_result(&batch_id, &valid(1)).await.unwrap().changed);
}

#[tokio::test]
async fn test_reserve_items_assigns_contiguous_positions() {
    let store = memory_store().await;
    let batch_id = store.create("alice", 5).await.unwrap();

    let first = store
        .reserve_items(&batch_id, &[(SourceKind::Url, "a".to_string()), (SourceKind::Url, "b".to_string())])
        .await
        .unwrap();
    let second = store
        .reserve_items(&batch_id, &[(SourceKind::Upload, "c.png".to_string())])
        .await
        .unwrap();

    assert_eq!(first, 0);
    assert_eq!(second, 2);
    assert_eq!(store.get_status(&batch_id).await.unwrap().submitted, 3);

    let err = store
        .reserve_items(&batch_id, &vec![(SourceKind::Url, "d".to_string()); 3])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn test_reserve_on_terminal_batch_conflicts() {
    let store = memory_store().await;
    let batch_id = store.create("alice", 2).await.unwrap();
    store.mark_failed(&batch_id, "gone").await.unwrap();

    let err = store
        .reserve_items(&batch_id, &[(SourceKind::Url, "a".to_string())])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
}

#[tokio::test]
async fn test_pending_items_exclude_recorded_results() {
    let store = memory_store().await;
    let batch_id = store.create("alice", 3).await.unwrap();
    store
        .reserve_items(
            &batch_id,
            &[
                (SourceKind::Url, "https://a".to_string()),
                (SourceKind::Upload, "b.png".to_string()),
                (SourceKind::Url, "https://c".to_string()),
            ],
        )
        .await
        .unwrap();
    store.apply_result(&batch_id, &valid(1)).await.unwrap();

    let pending = store.pending_items(&batch_id).await.unwrap();
    let positions: Vec<u64> = pending.iter().map(|p| p.position).collect();
    assert_eq!(positions, vec![0, 2]);
    assert_eq!(pending[1].source_ref, "https://c");
    assert_eq!(pending[0].kind, SourceKind::Url);
}

#[tokio::test]
async fn test_active_batches_lists_unfinished_only() {
    let store = memory_store().await;
    let open = store.create("alice", 2).await.unwrap();
    let done = store.create("alice", 1).await.unwrap();
    store.apply_result(&done, &valid(0)).await.unwrap();
    store.mark_finalized(&done).await.unwrap();

    assert_eq!(store.active_batches().await.unwrap(), vec![open]);
}

#[tokio::test]
async fn test_deleted_batch_is_not_found_for_appliers() {
    let store = memory_store().await;
    let batch_id = store.create("alice", 2).await.unwrap();
    store.apply_result(&batch_id, &valid(0)).await.unwrap();

    store.delete(&batch_id).await.unwrap();

    assert!(store.apply_result(&batch_id, &valid(1)).await.unwrap_err().is_not_found());
    assert!(store.results(&batch_id).await.unwrap().is_empty());
    assert!(store.delete(&batch_id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_results_round_trip_with_bounding_box() {
    let store = memory_store().await;
    let batch_id = store.create("alice", 1).await.unwrap();

    let mut classification = Classification::valid(0.66, "yolov8s");
    classification.bounding_box = Some(lbo_server::models::BoundingBox {
        x1: 1.0,
        y1: 2.0,
        x2: 3.0,
        y2: 4.0,
    });
    let result = ItemResult::classified(0, "a.png", classification, 40);
    store.apply_result(&batch_id, &result).await.unwrap();

    let view = store.get_status_with_results(&batch_id).await.unwrap();
    assert_eq!(view.results, Some(vec![result]));
}

#[tokio::test]
async fn test_mutations_publish_events() {
    let store = memory_store().await;
    let mut rx = store.events().subscribe();
    let batch_id = store.create("alice", 1).await.unwrap();

    store.apply_result(&batch_id, &valid(0)).await.unwrap();
    store.apply_result(&batch_id, &valid(0)).await.unwrap();
    store.mark_finalized(&batch_id).await.unwrap();

    match rx.recv().await.unwrap() {
        BatchEvent::Progress { processed, total, percentage, .. } => {
            assert_eq!((processed, total), (1, 1));
            assert_eq!(percentage, 100.0);
        }
        other => panic!("expected progress, got {:?}", other),
    }
    // The duplicate apply published nothing
    assert!(matches!(rx.recv().await.unwrap(), BatchEvent::Complete { .. }));
    assert!(rx.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appliers_on_one_batch() {
    let store = memory_store().await;
    let batch_id = store.create("alice", 50).await.unwrap();

    let mut handles = Vec::new();
    for worker in 0..4u64 {
        let store = store.clone();
        let batch_id = batch_id.clone();
        handles.push(tokio::spawn(async move {
            // Every worker applies every position; only the first write of each counts
            for position in 0..50u64 {
                let result = if (position + worker) % 2 == 0 { valid(position) } else { invalid(position) };
                let outcome = store.apply_result(&batch_id, &result).await.unwrap();
                assert!(outcome.counts.is_consistent());
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let view = store.get_status(&batch_id).await.unwrap();
    assert_eq!(view.processed, 50);
    assert_eq!(view.valid_count + view.invalid_count, 50);
    assert_eq!(store.results(&batch_id).await.unwrap().len(), 50);
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("batches.db");

    let batch_id = {
        let pool = db::init_database_pool(&path).await.unwrap();
        let store = BatchStore::new(pool.clone(), EventBus::new(16), 5000);
        let batch_id = store.create("alice", 3).await.unwrap();
        store.apply_result(&batch_id, &valid(0)).await.unwrap();
        store.apply_result(&batch_id, &invalid(1)).await.unwrap();
        pool.close().await;
        batch_id
    };

    let pool = db::init_database_pool(&path).await.unwrap();
    let store = BatchStore::new(pool, EventBus::new(16), 5000);

    let view = store.get_status_with_results(&batch_id).await.unwrap();
    assert_eq!(view.status, BatchStatus::Processing);
    assert_eq!(view.processed, 2);
    // Counters and results were committed together
    assert_eq!(view.results.as_ref().map(Vec::len), Some(2));
    assert_eq!(store.active_batches().await.unwrap(), vec![batch_id]);
}
