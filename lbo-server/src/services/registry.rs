//! Connection registry
//!
//! Maps stable client ids to their current transport and batch subscriptions.
//! Subscriptions belong to the client id, not the socket: when a transport goes
//! away the entry waits in `Reconnecting` until the same client id reattaches or
//! the idle ceiling elapses.
//!
//! Lifecycle of an entry:
//! - `register` on a new id: Connected
//! - transport closed (`unregister`) or liveness expired (`sweep`): Reconnecting
//! - `register` on the same id: Connected again, subscriptions restored
//! - more than `max_reconnect_attempts` reconnects without a pong, or idle past the
//!   ceiling: abandoned (subscriptions discarded)
//!
//! A freshly attached transport is "greeting" until `finish_greeting` queues the
//! connection notice and replay; pushes arriving in between are held and sent
//! after the greeting. Per batch, a progress push carrying fewer processed items
//! than one already queued on the transport is discarded, so counters seen by a
//! client never move backwards.

use lbo_common::config::ConnectionConfig;
use lbo_common::events::ServerMessage;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outbound side of one client connection
pub type Transport = mpsc::Sender<ServerMessage>;

/// Distinguishes successive connections of the same client id
pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// Transport gone, subscriptions retained
    Reconnecting,
}

/// Liveness and reconnection limits
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryConfig {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub idle_ceiling: Duration,
    pub max_reconnect_attempts: u32,
    pub outbound_buffer: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from_config(&ConnectionConfig::default())
    }
}

impl RegistryConfig {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            ping_interval: Duration::from_secs(config.ping_interval_secs),
            pong_timeout: Duration::from_secs(config.pong_timeout_secs),
            idle_ceiling: Duration::from_secs(config.idle_ceiling_secs),
            max_reconnect_attempts: config.max_reconnect_attempts,
            outbound_buffer: config.outbound_buffer.max(1),
        }
    }

    /// Silence after which a connected transport is considered dead
    pub fn liveness_window(&self) -> Duration {
        self.ping_interval + self.pong_timeout
    }
}

/// Result of attaching a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub client_id: String,
    pub connection_id: ConnectionId,
    /// True when a previous connection of this client id was restored
    pub reconnected: bool,
    /// Subscriptions carried over from before this connection, sorted
    pub subscriptions: Vec<String>,
}

/// What one sweep removed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Client ids whose transport was dropped for missing liveness acks
    pub expired: Vec<String>,
    /// Client ids removed entirely after the idle ceiling
    pub evicted: Vec<String>,
}

/// The live side of a client entry
struct Attachment {
    connection_id: ConnectionId,
    transport: Transport,
    /// Pushes held until the greeting is queued; None once greeted
    held: Option<Vec<ServerMessage>>,
    /// Highest processed count queued per batch
    high_water: HashMap<String, u64>,
}

impl Attachment {
    fn new(connection_id: ConnectionId, transport: Transport) -> Self {
        Self {
            connection_id,
            transport,
            held: Some(Vec::new()),
            high_water: HashMap::new(),
        }
    }

    /// Queue on the transport unless it would regress a batch's counters
    fn deliver(&mut self, client_id: &str, message: ServerMessage) -> bool {
        let mark = match &message {
            ServerMessage::Batch(event) => Some((event.batch_id().to_string(), event.processed())),
            _ => None,
        };

        if let Some((batch_id, Some(processed))) = &mark {
            if self.high_water.get(batch_id).is_some_and(|seen| processed < seen) {
                tracing::debug!(client_id = %client_id, batch_id = %batch_id, processed, "Skipping superseded progress push");
                return false;
            }
        }

        match self.transport.try_send(message) {
            Ok(()) => {
                match mark {
                    Some((batch_id, Some(processed))) => {
                        self.high_water.insert(batch_id, processed);
                    }
                    Some((batch_id, None)) => {
                        self.high_water.remove(&batch_id);
                    }
                    None => {}
                }
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(client_id = %client_id, "Outbound buffer full, dropping push");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(client_id = %client_id, "Transport closed, dropping push");
                false
            }
        }
    }
}

struct ClientEntry {
    transport: Option<Attachment>,
    subscriptions: HashSet<String>,
    last_ack: Instant,
    disconnected_at: Option<Instant>,
    reconnect_attempts: u32,
    ever_connected: bool,
}

impl ClientEntry {
    fn detached(now: Instant) -> Self {
        Self {
            transport: None,
            subscriptions: HashSet::new(),
            last_ack: now,
            disconnected_at: Some(now),
            reconnect_attempts: 0,
            ever_connected: false,
        }
    }

    fn state(&self) -> ConnectionState {
        if self.transport.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Reconnecting
        }
    }

    fn sorted_subscriptions(&self) -> Vec<String> {
        let mut subs: Vec<String> = self.subscriptions.iter().cloned().collect();
        subs.sort();
        subs
    }
}

/// Client id → transport and subscriptions
pub struct ConnectionRegistry {
    clients: RwLock<HashMap<String, ClientEntry>>,
    next_connection_id: AtomicU64,
    config: RegistryConfig,
}

impl ConnectionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Attach a transport to `client_id`
    ///
    /// A live transport already attached to the id is replaced (and thereby closed).
    /// The new transport holds pushes until [`finish_greeting`](Self::finish_greeting).
    pub async fn register(&self, client_id: &str, transport: Transport) -> Connection {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut clients = self.clients.write().await;

        let entry = clients
            .entry(client_id.to_string())
            .or_insert_with(|| ClientEntry::detached(now));

        let mut reconnected = false;
        if entry.ever_connected {
            entry.reconnect_attempts += 1;
            if entry.reconnect_attempts > self.config.max_reconnect_attempts {
                tracing::warn!(
                    client_id = %client_id,
                    attempts = entry.reconnect_attempts,
                    "Reconnect ceiling exceeded, abandoning previous subscriptions"
                );
                entry.subscriptions.clear();
                entry.reconnect_attempts = 0;
            } else {
                reconnected = true;
            }
        }

        if entry.transport.is_some() {
            tracing::debug!(client_id = %client_id, "Replacing live transport");
        }

        entry.transport = Some(Attachment::new(connection_id, transport));
        entry.last_ack = now;
        entry.disconnected_at = None;
        entry.ever_connected = true;

        let subscriptions = entry.sorted_subscriptions();

        tracing::info!(
            client_id = %client_id,
            connection_id,
            reconnected,
            subscriptions = subscriptions.len(),
            "Client connected"
        );

        Connection {
            client_id: client_id.to_string(),
            connection_id,
            reconnected,
            subscriptions,
        }
    }

    /// Detach the transport if `connection_id` is still the current one
    ///
    /// Subscriptions are kept for a later reconnect.
    pub async fn unregister(&self, client_id: &str, connection_id: ConnectionId) -> bool {
        let mut clients = self.clients.write().await;
        let Some(entry) = clients.get_mut(client_id) else {
            return false;
        };

        match &entry.transport {
            Some(current) if current.connection_id == connection_id => {
                entry.transport = None;
                entry.disconnected_at = Some(Instant::now());
                tracing::info!(client_id = %client_id, connection_id, "Client disconnected");
                true
            }
            _ => false,
        }
    }

    /// Client keep-alive
    pub async fn heartbeat(&self, client_id: &str) -> bool {
        let mut clients = self.clients.write().await;
        match clients.get_mut(client_id) {
            Some(entry) => {
                entry.last_ack = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Acknowledgement of a server ping; the connection is healthy again
    pub async fn pong(&self, client_id: &str) -> bool {
        let mut clients = self.clients.write().await;
        match clients.get_mut(client_id) {
            Some(entry) => {
                entry.last_ack = Instant::now();
                entry.reconnect_attempts = 0;
                true
            }
            None => false,
        }
    }

    /// Subscribe `client_id` to `batch_id`, creating a detached entry if needed
    pub async fn subscribe(&self, client_id: &str, batch_id: &str) {
        let mut clients = self.clients.write().await;
        let entry = clients
            .entry(client_id.to_string())
            .or_insert_with(|| ClientEntry::detached(Instant::now()));
        if entry.subscriptions.insert(batch_id.to_string()) {
            tracing::debug!(client_id = %client_id, batch_id = %batch_id, "Subscribed");
        }
    }

    pub async fn unsubscribe(&self, client_id: &str, batch_id: &str) {
        let mut clients = self.clients.write().await;
        if let Some(entry) = clients.get_mut(client_id) {
            entry.subscriptions.remove(batch_id);
        }
    }

    /// Drop `batch_id` from every subscription set
    pub async fn remove_batch(&self, batch_id: &str) {
        let mut clients = self.clients.write().await;
        for entry in clients.values_mut() {
            entry.subscriptions.remove(batch_id);
        }
    }

    /// Client ids subscribed to `batch_id`
    pub async fn subscribers_of(&self, batch_id: &str) -> Vec<String> {
        let clients = self.clients.read().await;
        clients
            .iter()
            .filter(|(_, entry)| entry.subscriptions.contains(batch_id))
            .map(|(client_id, _)| client_id.clone())
            .collect()
    }

    /// Queue `message` on the client's transport without waiting
    ///
    /// Returns false when the message is dropped: no live transport, a full
    /// buffer, or a progress push older than one already queued. While the
    /// transport is greeting the message is held instead (up to the outbound
    /// buffer size).
    pub async fn send(&self, client_id: &str, message: ServerMessage) -> bool {
        let mut clients = self.clients.write().await;
        let Some(attachment) = clients.get_mut(client_id).and_then(|e| e.transport.as_mut()) else {
            return false;
        };

        if let Some(held) = attachment.held.as_mut() {
            if held.len() >= self.config.outbound_buffer {
                tracing::warn!(client_id = %client_id, "Greeting backlog full, dropping push");
                return false;
            }
            held.push(message);
            return true;
        }

        attachment.deliver(client_id, message)
    }

    /// Queue `greeting` on connection `connection_id`, then release held pushes
    ///
    /// Does nothing (and returns false) when that connection is no longer the
    /// client's current one.
    pub async fn finish_greeting(
        &self,
        client_id: &str,
        connection_id: ConnectionId,
        greeting: Vec<ServerMessage>,
    ) -> bool {
        let mut clients = self.clients.write().await;
        let Some(attachment) = clients
            .get_mut(client_id)
            .and_then(|e| e.transport.as_mut())
            .filter(|a| a.connection_id == connection_id)
        else {
            return false;
        };

        let held = attachment.held.take().unwrap_or_default();
        for message in greeting.into_iter().chain(held) {
            attachment.deliver(client_id, message);
        }
        true
    }

    pub async fn subscriptions(&self, client_id: &str) -> Vec<String> {
        let clients = self.clients.read().await;
        clients
            .get(client_id)
            .map(ClientEntry::sorted_subscriptions)
            .unwrap_or_default()
    }

    /// Every batch id with at least one subscriber
    pub async fn all_subscribed_batches(&self) -> HashSet<String> {
        let clients = self.clients.read().await;
        clients
            .values()
            .flat_map(|entry| entry.subscriptions.iter().cloned())
            .collect()
    }

    pub async fn live_connections(&self) -> usize {
        let clients = self.clients.read().await;
        clients.values().filter(|e| e.transport.is_some()).count()
    }

    pub async fn state(&self, client_id: &str) -> Option<ConnectionState> {
        let clients = self.clients.read().await;
        clients.get(client_id).map(ClientEntry::state)
    }

    /// Expire silent transports and evict long-detached entries
    pub async fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let liveness = self.config.liveness_window();
        let mut clients = self.clients.write().await;

        for (client_id, entry) in clients.iter_mut() {
            if entry.transport.is_some() && now.saturating_duration_since(entry.last_ack) > liveness {
                tracing::warn!(client_id = %client_id, "Liveness probe unanswered, dropping connection");
                entry.transport = None;
                entry.disconnected_at = Some(now);
                report.expired.push(client_id.clone());
            }
        }

        clients.retain(|client_id, entry| {
            let idle = entry
                .disconnected_at
                .map(|at| now.saturating_duration_since(at) >= self.config.idle_ceiling)
                .unwrap_or(false);
            if entry.transport.is_none() && idle {
                tracing::info!(
                    client_id = %client_id,
                    subscriptions = entry.subscriptions.len(),
                    "Idle ceiling reached, discarding client"
                );
                report.evicted.push(client_id.clone());
                false
            } else {
                true
            }
        });

        report
    }

    /// Run `sweep` every ping interval until cancelled
    pub fn spawn_reaper(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.ping_interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Connection reaper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = self.sweep(Instant::now()).await;
                        if !report.expired.is_empty() || !report.evicted.is_empty() {
                            tracing::debug!(
                                expired = report.expired.len(),
                                evicted = report.evicted.len(),
                                "Connection sweep"
                            );
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lbo_common::events::{BatchEvent, ConnectionNotice};
    use lbo_common::ProgressCounts;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(RegistryConfig {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            idle_ceiling: Duration::from_secs(300),
            max_reconnect_attempts: 2,
            outbound_buffer: 4,
        })
    }

    fn transport() -> (Transport, mpsc::Receiver<ServerMessage>) {
        mpsc::channel(4)
    }

    fn progress(batch_id: &str, processed: u64) -> ServerMessage {
        BatchEvent::progress(
            batch_id,
            ProgressCounts {
                processed,
                total: 10,
                valid: processed,
                invalid: 0,
            },
        )
        .into()
    }

    fn processed_of(message: Option<ServerMessage>) -> u64 {
        match message {
            Some(ServerMessage::Batch(event)) => event.processed().unwrap(),
            other => panic!("expected a progress push, got {:?}", other),
        }
    }

    /// Attach and greet with nothing, so pushes flow straight through
    async fn attach(registry: &ConnectionRegistry, client_id: &str, tx: Transport) -> Connection {
        let conn = registry.register(client_id, tx).await;
        registry.finish_greeting(client_id, conn.connection_id, Vec::new()).await;
        conn
    }

    #[tokio::test]
    async fn test_first_register_is_not_reconnect() {
        let registry = registry();
        let (tx, _rx) = transport();
        let conn = registry.register("alice", tx).await;
        assert!(!conn.reconnected);
        assert_eq!(registry.state("alice").await, Some(ConnectionState::Connected));
    }

    #[tokio::test]
    async fn test_reconnect_restores_subscriptions() {
        let registry = registry();
        let (tx, _rx) = transport();
        let first = registry.register("alice", tx).await;
        registry.subscribe("alice", "batch-1").await;

        assert!(registry.unregister("alice", first.connection_id).await);
        assert_eq!(registry.state("alice").await, Some(ConnectionState::Reconnecting));

        let (tx, _rx) = transport();
        let second = registry.register("alice", tx).await;
        assert!(second.reconnected);
        assert_eq!(second.subscriptions, vec!["batch-1".to_string()]);
    }

    #[tokio::test]
    async fn test_stale_unregister_is_ignored() {
        let registry = registry();
        let (tx1, _rx1) = transport();
        let first = registry.register("alice", tx1).await;
        let (tx2, _rx2) = transport();
        let _second = registry.register("alice", tx2).await;

        assert!(!registry.unregister("alice", first.connection_id).await);
        assert_eq!(registry.state("alice").await, Some(ConnectionState::Connected));
    }

    #[tokio::test]
    async fn test_reconnect_ceiling_abandons_subscriptions() {
        let registry = registry();
        registry.subscribe("alice", "batch-1").await;

        for _ in 0..3 {
            let (tx, _rx) = transport();
            let conn = registry.register("alice", tx).await;
            registry.unregister("alice", conn.connection_id).await;
        }

        // Third reconnect exceeds the ceiling of 2
        let (tx, _rx) = transport();
        let conn = registry.register("alice", tx).await;
        assert!(!conn.reconnected);
        assert!(conn.subscriptions.is_empty());
    }

    #[tokio::test]
    async fn test_pong_resets_reconnect_counter() {
        let registry = registry();
        registry.subscribe("alice", "batch-1").await;

        for _ in 0..6 {
            let (tx, _rx) = transport();
            let conn = registry.register("alice", tx).await;
            registry.pong("alice").await;
            registry.unregister("alice", conn.connection_id).await;
        }

        let (tx, _rx) = transport();
        let conn = registry.register("alice", tx).await;
        assert!(conn.reconnected);
        assert_eq!(conn.subscriptions, vec!["batch-1".to_string()]);
    }

    #[tokio::test]
    async fn test_subscribe_before_connect_creates_detached_entry() {
        let registry = registry();
        registry.subscribe("bob", "batch-9").await;
        assert_eq!(registry.state("bob").await, Some(ConnectionState::Reconnecting));

        let (tx, _rx) = transport();
        let conn = registry.register("bob", tx).await;
        assert!(!conn.reconnected);
        assert_eq!(conn.subscriptions, vec!["batch-9".to_string()]);
    }

    #[tokio::test]
    async fn test_send_delivers_and_drops_when_detached() {
        let registry = registry();
        let (tx, mut rx) = transport();
        let conn = attach(&registry, "alice", tx).await;

        assert!(registry.send("alice", ServerMessage::ping()).await);
        assert!(matches!(rx.recv().await, Some(ServerMessage::Probe(_))));

        registry.unregister("alice", conn.connection_id).await;
        assert!(!registry.send("alice", ServerMessage::ping()).await);
        assert!(!registry.send("nobody", ServerMessage::ping()).await);
    }

    #[tokio::test]
    async fn test_send_drops_when_buffer_full() {
        let registry = registry();
        let (tx, _rx) = mpsc::channel(1);
        attach(&registry, "alice", tx).await;

        assert!(registry.send("alice", ServerMessage::ping()).await);
        assert!(!registry.send("alice", ServerMessage::ping()).await);
    }

    #[tokio::test]
    async fn test_pushes_wait_for_the_greeting() {
        let registry = registry();
        registry.subscribe("alice", "batch-1").await;
        let (tx, _rx) = transport();
        let first = attach(&registry, "alice", tx).await;
        registry.unregister("alice", first.connection_id).await;

        let (tx, mut rx2) = transport();
        let conn = registry.register("alice", tx).await;
        assert!(conn.reconnected);

        // Broadcaster pushes land between attach and greeting
        assert!(registry.send("alice", progress("batch-1", 1)).await);
        assert!(rx2.try_recv().is_err());

        let notice: ServerMessage = ConnectionNotice::Reconnected {
            recovered_batches: vec!["batch-1".to_string()],
        }
        .into();
        assert!(
            registry
                .finish_greeting("alice", conn.connection_id, vec![notice, progress("batch-1", 1)])
                .await
        );

        assert!(matches!(
            rx2.recv().await,
            Some(ServerMessage::Notice(ConnectionNotice::Reconnected { .. }))
        ));
        assert_eq!(processed_of(rx2.recv().await), 1);
        // Held push equal to the replay is still delivered; counters do not regress
        assert_eq!(processed_of(rx2.recv().await), 1);
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_progress_never_follows_newer_counters() {
        let registry = registry();
        let (tx, mut rx) = transport();
        let conn = registry.register("alice", tx).await;

        // Replay read 3 items, but an older push for 2 was held meanwhile
        registry.send("alice", progress("batch-1", 2)).await;
        registry
            .finish_greeting("alice", conn.connection_id, vec![progress("batch-1", 3)])
            .await;

        assert!(!registry.send("alice", progress("batch-1", 1)).await);
        assert!(registry.send("alice", progress("batch-1", 4)).await);
        assert!(registry.send("alice", progress("batch-2", 1)).await);

        assert_eq!(processed_of(rx.recv().await), 3);
        assert_eq!(processed_of(rx.recv().await), 4);
        assert_eq!(processed_of(rx.recv().await), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_greeting_for_replaced_connection_is_ignored() {
        let registry = registry();
        let (tx1, _rx1) = transport();
        let old = registry.register("alice", tx1).await;
        let (tx2, mut rx2) = transport();
        let _new = registry.register("alice", tx2).await;

        assert!(!registry.finish_greeting("alice", old.connection_id, vec![ServerMessage::ping()]).await);
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sweep_expires_silent_transport_but_keeps_subscriptions() {
        let registry = registry();
        let (tx, mut rx) = transport();
        registry.register("alice", tx).await;
        registry.subscribe("alice", "batch-1").await;

        let later = Instant::now() + Duration::from_secs(41);
        let report = registry.sweep(later).await;
        assert_eq!(report.expired, vec!["alice".to_string()]);
        assert!(report.evicted.is_empty());

        // Transport sender dropped by the registry
        assert!(rx.recv().await.is_none());
        assert_eq!(registry.subscriptions("alice").await, vec!["batch-1".to_string()]);
    }

    #[tokio::test]
    async fn test_sweep_keeps_acknowledged_transport() {
        let registry = registry();
        let (tx, _rx) = transport();
        registry.register("alice", tx).await;

        let report = registry.sweep(Instant::now() + Duration::from_secs(20)).await;
        assert!(report.expired.is_empty());
        assert_eq!(registry.live_connections().await, 1);
    }

    #[tokio::test]
    async fn test_sweep_evicts_after_idle_ceiling() {
        let registry = registry();
        let (tx, _rx) = transport();
        let conn = registry.register("alice", tx).await;
        registry.subscribe("alice", "batch-1").await;
        registry.unregister("alice", conn.connection_id).await;

        let report = registry.sweep(Instant::now() + Duration::from_secs(301)).await;
        assert_eq!(report.evicted, vec!["alice".to_string()]);
        assert_eq!(registry.state("alice").await, None);
        assert!(registry.all_subscribed_batches().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_batch_clears_every_subscriber() {
        let registry = registry();
        registry.subscribe("alice", "batch-1").await;
        registry.subscribe("bob", "batch-1").await;
        registry.subscribe("bob", "batch-2").await;

        registry.remove_batch("batch-1").await;
        assert!(registry.subscribers_of("batch-1").await.is_empty());
        assert_eq!(registry.subscribers_of("batch-2").await, vec!["bob".to_string()]);
    }
}
