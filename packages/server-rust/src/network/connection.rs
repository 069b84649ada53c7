//! Socket connection registry.
//!
//! Each accepted socket gets a bounded outbound channel drained by its
//! write loop, so acknowledgments from concurrent events never block on
//! the wire. The registry itself is a `DashMap` keyed by connection id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::config::ConnectionConfig;

/// Unique identifier for a connection, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Frame queued for a socket's write loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// A JSON text frame.
    Text(String),
    /// A close frame with an optional reason.
    Close(Option<String>),
}

/// Error returned when queueing a frame fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("outbound queue stayed full")]
    Timeout,
    #[error("connection closed")]
    Disconnected,
}

/// Identity of the session behind a connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    pub session_id: Uuid,
    pub namespace: Arc<str>,
    /// Owner from connect-time authentication, if any.
    pub owner: Option<String>,
}

/// Handle to a single socket, used to queue outbound frames.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub tx: mpsc::Sender<OutboundMessage>,
    pub metadata: ConnectionMetadata,
    pub connected_at: Instant,
}

impl ConnectionHandle {
    /// Queue a frame without waiting. Returns `false` when the queue is
    /// full or the socket is gone.
    #[must_use]
    pub fn try_send(&self, msg: OutboundMessage) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    /// Queue a frame, waiting up to `timeout` for room.
    ///
    /// # Errors
    ///
    /// `SendError::Timeout` if the queue stays full, `SendError::Disconnected`
    /// if the write loop has exited.
    pub async fn send_timeout(
        &self,
        msg: OutboundMessage,
        timeout: Duration,
    ) -> Result<(), SendError> {
        match tokio::time::timeout(timeout, self.tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Disconnected),
            Err(_) => Err(SendError::Timeout),
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Thread-safe registry of open sockets.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Creates an empty registry. Ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a socket, returning its handle and the receiver for the
    /// write loop.
    pub fn register(
        &self,
        metadata: ConnectionMetadata,
        config: &ConnectionConfig,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity);

        let handle = Arc::new(ConnectionHandle {
            id,
            tx,
            metadata,
            connected_at: Instant::now(),
        });

        self.connections.insert(id, Arc::clone(&handle));
        (handle, rx)
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&id).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Number of open sockets in one namespace.
    #[must_use]
    pub fn count_in_namespace(&self, namespace: &str) -> usize {
        self.connections
            .iter()
            .filter(|entry| &*entry.value().metadata.namespace == namespace)
            .count()
    }

    #[must_use]
    pub fn connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Queue a text frame on every socket in a namespace. Sockets with a
    /// full queue are skipped. Returns how many accepted the frame.
    pub fn broadcast(&self, namespace: &str, text: &str) -> usize {
        self.connections
            .iter()
            .filter(|entry| &*entry.value().metadata.namespace == namespace)
            .filter(|entry| entry.value().try_send(OutboundMessage::Text(text.to_string())))
            .count()
    }

    /// Removes and returns all connections. Used during graceful shutdown.
    pub fn drain_all(&self) -> Vec<Arc<ConnectionHandle>> {
        let keys: Vec<ConnectionId> = self
            .connections
            .iter()
            .map(|entry| *entry.key())
            .collect();

        keys.into_iter()
            .filter_map(|key| self.connections.remove(&key).map(|(_, handle)| handle))
            .collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
