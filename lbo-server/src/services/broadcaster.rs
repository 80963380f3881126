//! Progress broadcaster
//!
//! Consumes batch store mutations from the EventBus and pushes them to every
//! client subscribed to the batch. Pushes are best effort: a push to a client
//! without a live transport is dropped, never queued. Every event carries
//! absolute counters, so the next push (or a replay on reconnect) supersedes
//! whatever was lost.

use lbo_common::events::{BatchEvent, ConnectionNotice, ServerMessage};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::BatchStore;
use crate::services::registry::{Connection, ConnectionRegistry};

/// Fans batch events out to subscribed connections
#[derive(Clone)]
pub struct ProgressBroadcaster {
    registry: Arc<ConnectionRegistry>,
    store: BatchStore,
}

impl ProgressBroadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, store: BatchStore) -> Self {
        Self { registry, store }
    }

    /// Push `event` to every subscriber of its batch
    ///
    /// Terminal events (`complete`, `error`) end the batch's subscriptions.
    /// Returns the number of clients the event was queued for.
    pub async fn publish(&self, event: &BatchEvent) -> usize {
        let batch_id = event.batch_id();
        let subscribers = self.registry.subscribers_of(batch_id).await;

        let mut delivered = 0;
        for client_id in &subscribers {
            if self
                .registry
                .send(client_id, ServerMessage::Batch(event.clone()))
                .await
            {
                delivered += 1;
            }
        }

        tracing::debug!(
            batch_id = %batch_id,
            event = event.event_type(),
            subscribers = subscribers.len(),
            delivered,
            "Batch event pushed"
        );

        if event.is_terminal() {
            self.registry.remove_batch(batch_id).await;
        }

        delivered
    }

    /// Forward bus events until cancelled or the bus closes
    pub async fn run(&self, mut rx: broadcast::Receiver<BatchEvent>, cancel: CancellationToken) {
        tracing::info!("Progress broadcaster started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => {
                        self.publish(&event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Broadcaster lagged behind the event bus, resynchronizing");
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }

        tracing::info!("Progress broadcaster stopped");
    }

    pub fn spawn(self, rx: broadcast::Receiver<BatchEvent>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(rx, cancel).await })
    }

    /// Push the stored state of every subscribed batch
    pub async fn resync(&self) {
        for batch_id in self.registry.all_subscribed_batches().await {
            match self.store.get_status(&batch_id).await {
                Ok(view) => {
                    self.publish(&view.current_event()).await;
                }
                Err(e) if e.is_not_found() => self.registry.remove_batch(&batch_id).await,
                Err(e) => {
                    tracing::warn!(batch_id = %batch_id, error = %e, "Resync read failed");
                }
            }
        }
    }

    /// Greet a newly attached connection
    ///
    /// Queues `connected` or `reconnected` (listing subscribed batches still in
    /// progress), then the current progress of each of those batches, ahead of
    /// any push published since the transport was registered. Subscriptions to
    /// finished or deleted batches are dropped here.
    pub async fn on_connect(&self, connection: &Connection) {
        let client_id = &connection.client_id;
        let mut in_progress = Vec::new();

        for batch_id in &connection.subscriptions {
            match self.store.get_status(batch_id).await {
                Ok(view) if !view.status.is_terminal() => in_progress.push(view),
                Ok(_) => self.registry.unsubscribe(client_id, batch_id).await,
                Err(e) if e.is_not_found() => self.registry.unsubscribe(client_id, batch_id).await,
                Err(e) => {
                    tracing::warn!(client_id = %client_id, batch_id = %batch_id, error = %e, "Status read failed on connect");
                }
            }
        }

        let notice = if connection.reconnected {
            ConnectionNotice::Reconnected {
                recovered_batches: in_progress.iter().map(|v| v.batch_id.clone()).collect(),
            }
        } else {
            ConnectionNotice::Connected {
                client_id: client_id.clone(),
            }
        };
        let mut greeting: Vec<ServerMessage> = Vec::with_capacity(in_progress.len() + 1);
        greeting.push(notice.into());
        greeting.extend(in_progress.iter().map(|view| view.current_event().into()));

        // Pushes published since `register` were held and follow the greeting
        if !self
            .registry
            .finish_greeting(client_id, connection.connection_id, greeting)
            .await
        {
            tracing::debug!(client_id = %client_id, "Connection replaced before greeting");
            return;
        }

        if connection.reconnected {
            tracing::info!(
                client_id = %client_id,
                recovered = in_progress.len(),
                "Reconnect replay sent"
            );
        }
    }

    /// Push the current state of one batch to one client
    pub async fn replay(&self, client_id: &str, batch_id: &str) -> lbo_common::Result<()> {
        let view = self.store.get_status(batch_id).await?;
        let event = view.current_event();
        self.registry.send(client_id, event.into()).await;
        if view.status.is_terminal() {
            self.registry.unsubscribe(client_id, batch_id).await;
        }
        Ok(())
    }
}
