// Subscription hub: live client connections, the leagues each one follows,
// and best-effort fan-out of events to them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::league::LeagueId;
use crate::protocol::ServerEvent;

pub type ConnectionId = u64;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket write failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    #[error("peer went away")]
    PeerGone,

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Write half of a client connection.
#[async_trait]
pub trait ConnectionSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Close the underlying transport. Errors are swallowed; the connection
    /// is going away either way.
    async fn close(&mut self);
}

/// Sink over the write half of a tokio-tungstenite WebSocket.
pub struct WsSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

impl<S> WsSink<S> {
    pub fn new(inner: SplitSink<WebSocketStream<S>, Message>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S> ConnectionSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.inner.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.inner.close().await {
            debug!("Error closing websocket: {e}");
        }
    }
}

/// Sink that forwards frames into an in-process channel. Sending fails once
/// the receiver is dropped.
pub struct ChannelSink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl ChannelSink {
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }
}

#[async_trait]
impl ConnectionSink for ChannelSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx.send(text).map_err(|_| TransportError::PeerGone),
            None => Err(TransportError::PeerGone),
        }
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A registered client: its subscription set plus a write lock around the
/// sink so concurrent writers never interleave frames.
pub struct Connection {
    id: ConnectionId,
    subscriptions: Mutex<HashSet<LeagueId>>,
    writer: tokio::sync::Mutex<Box<dyn ConnectionSink>>,
    closed: AtomicBool,
}

impl Connection {
    fn new(id: ConnectionId, sink: Box<dyn ConnectionSink>) -> Self {
        Self {
            id,
            subscriptions: Mutex::new(HashSet::new()),
            writer: tokio::sync::Mutex::new(sink),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    fn subs(&self) -> MutexGuard<'_, HashSet<LeagueId>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_subscribed(&self, league_id: LeagueId) -> bool {
        self.subs().contains(&league_id)
    }

    /// Subscribed league IDs, sorted.
    pub fn subscriptions(&self) -> Vec<LeagueId> {
        let mut leagues: Vec<LeagueId> = self.subs().iter().copied().collect();
        leagues.sort_unstable();
        leagues
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn write(&self, text: String) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(TransportError::Closed(self.id));
        }
        writer.send_text(text).await
    }

    /// Close the sink. Only the first call reaches the transport.
    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.writer.lock().await.close().await;
    }
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

/// Registry of live connections with per-league fan-out.
///
/// Membership changes take the hub lock; writes take only the target
/// connection's own lock, so a slow socket never blocks registration or
/// subscription changes.
#[derive(Default)]
pub struct SubscriptionHub {
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicU64,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<Connection>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a connection with an empty subscription set.
    pub fn register(&self, sink: Box<dyn ConnectionSink>) -> Arc<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn = Arc::new(Connection::new(id, sink));
        self.connections().insert(id, Arc::clone(&conn));
        debug!("Registered connection {id}");
        conn
    }

    /// Remove the connection and close its socket. Safe to call any number
    /// of times; the socket is closed exactly once.
    pub async fn unregister(&self, conn: &Connection) {
        let removed = self.connections().remove(&conn.id).is_some();
        if removed {
            debug!("Unregistered connection {}", conn.id);
        }
        conn.close().await;
    }

    pub fn subscribe(&self, conn: &Connection, league_id: LeagueId) {
        if conn.subs().insert(league_id) {
            debug!("Connection {} subscribed to league {league_id}", conn.id);
        }
    }

    pub fn unsubscribe(&self, conn: &Connection, league_id: LeagueId) {
        if conn.subs().remove(&league_id) {
            debug!("Connection {} unsubscribed from league {league_id}", conn.id);
        }
    }

    /// Drop a departing client's interest in `league_id`. An in-flight turn
    /// for that player is unaffected; it times out and is auto-picked.
    pub fn handle_disconnect(&self, league_id: LeagueId, conn: &Connection) {
        self.unsubscribe(conn, league_id);
    }

    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections().get(&id).cloned()
    }

    /// Deliver `event` to every connection subscribed to `league_id` at the
    /// moment of the call. Returns how many connections received it.
    pub async fn broadcast_to_league(&self, league_id: LeagueId, event: &ServerEvent) -> usize {
        match event.encode() {
            Ok(payload) => self.broadcast_raw(league_id, payload).await,
            Err(e) => {
                warn!("Failed to encode {} for league {league_id}: {e}", event.kind());
                0
            }
        }
    }

    /// Broadcast an already-encoded frame. Connections whose write fails are
    /// unregistered; delivery to the others continues.
    pub async fn broadcast_raw(&self, league_id: LeagueId, payload: String) -> usize {
        let targets: Vec<Arc<Connection>> = self
            .connections()
            .values()
            .filter(|c| c.is_subscribed(league_id))
            .cloned()
            .collect();

        let mut delivered = 0;
        for conn in targets {
            match conn.write(payload.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        "Dropping connection {} after failed write to league {league_id}: {e}",
                        conn.id
                    );
                    self.unregister(&conn).await;
                }
            }
        }
        delivered
    }

    /// Send `event` to a single connection, unregistering it on failure.
    pub async fn send_to(&self, conn: &Connection, event: &ServerEvent) -> Result<(), TransportError> {
        let payload = event.encode()?;
        if let Err(e) = conn.write(payload).await {
            warn!("Dropping connection {} after failed write: {e}", conn.id);
            self.unregister(conn).await;
            return Err(e);
        }
        Ok(())
    }
}
