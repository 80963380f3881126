//! Shared test helpers: in-memory store, scripted classifier, polling
#![allow(dead_code)]

use async_trait::async_trait;
use lbo_common::events::EventBus;
use lbo_common::BatchStatus;
use lbo_server::db::{self, BatchStore};
use lbo_server::models::{BatchView, Classification, ItemSource};
use lbo_server::services::{
    Classifier, ClassifyError, DispatchSettings, PacingPolicy, RegistryConfig, RetryPolicy,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How the scripted classifier answers
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Every image has a logo
    Valid,
    /// Every call fails as if the service were down
    Unavailable,
    /// First `n` calls fail, later calls succeed
    FailFirst(usize),
    /// Never answers (exercises the per-attempt timeout)
    Hang,
    /// Valid when the source reference contains "logo"
    ByReference,
}

/// Classifier double that records concurrency
pub struct MockClassifier {
    behavior: Behavior,
    latency: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockClassifier {
    pub fn new(behavior: Behavior) -> Self {
        Self::with_latency(behavior, Duration::ZERO)
    }

    pub fn with_latency(behavior: Behavior, latency: Duration) -> Self {
        Self {
            behavior,
            latency,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Classifier for MockClassifier {
    async fn classify(&self, source: &ItemSource) -> Result<Classification, ClassifyError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match self.behavior {
            Behavior::Valid => Ok(Classification::valid(0.9, "mock-yolo")),
            Behavior::Unavailable => Err(ClassifyError::Unavailable("connection refused".to_string())),
            Behavior::FailFirst(n) if call < n => {
                Err(ClassifyError::BadStatus {
                    status: 503,
                    body: "warming up".to_string(),
                })
            }
            Behavior::FailFirst(_) => Ok(Classification::valid(0.8, "mock-yolo")),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Behavior::ByReference => {
                if source.reference().contains("logo") {
                    Ok(Classification::valid(0.75, "mock-yolo"))
                } else {
                    Ok(Classification::invalid())
                }
            }
        }
    }
}

/// Store over a private in-memory database
pub async fn memory_store() -> BatchStore {
    let pool = db::init_in_memory_pool()
        .await
        .expect("Failed to create in-memory database");
    BatchStore::new(pool, EventBus::new(1024), 5000)
}

/// Dispatcher settings without pacing, so tests finish quickly
pub fn fast_settings(max_concurrency: usize) -> DispatchSettings {
    DispatchSettings {
        chunk_size: 10,
        max_concurrency,
        retry: RetryPolicy {
            max_attempts: 3,
            backoff: Vec::new(),
        },
        classify_timeout: Duration::from_secs(5),
        pacing: PacingPolicy::immediate(),
    }
}

pub fn registry_config() -> RegistryConfig {
    RegistryConfig {
        ping_interval: Duration::from_secs(30),
        pong_timeout: Duration::from_secs(10),
        idle_ceiling: Duration::from_secs(300),
        max_reconnect_attempts: 5,
        outbound_buffer: 64,
    }
}

/// Poll until the batch reaches `status`
pub async fn wait_for_status(store: &BatchStore, batch_id: &str, status: BatchStatus) -> BatchView {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let view = store.get_status(batch_id).await.expect("batch exists");
        if view.status == status {
            return view;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "batch {} stuck in {} ({}/{})",
            batch_id,
            view.status,
            view.processed,
            view.total
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until at least `processed` items have results
pub async fn wait_for_processed(store: &BatchStore, batch_id: &str, processed: u64) -> BatchView {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let view = store.get_status(batch_id).await.expect("batch exists");
        if view.processed >= processed {
            return view;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "batch {} stuck at {}/{}",
            batch_id,
            view.processed,
            view.total
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn urls(prefix: &str, count: usize) -> Vec<ItemSource> {
    (0..count)
        .map(|i| ItemSource::Url(format!("https://images.test/{}/{}.jpg", prefix, i)))
        .collect()
}

pub fn shared(classifier: MockClassifier) -> Arc<MockClassifier> {
    Arc::new(classifier)
}
