//! Live connection registry.
//!
//! Tracks every open connection by identifier. An entry exists exactly as
//! long as the underlying channel is open from the relay's point of view;
//! removal is idempotent so racing read- and write-side failures collapse
//! into a single removal.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::RelayError;

/// Identifier for one live connection. Assigned at accept time, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a registered connection.
///
/// Only `Open` connections participate in broadcast. `Closing` is set while
/// a close frame is still in flight (relay shutdown); removal from the
/// registry is the terminal `Closed` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
}

/// Registry entry for one connection.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub state: ConnectionState,
    pub connected_at: DateTime<Utc>,
}

/// The set of live connections, guarded as one unit.
///
/// The lock covers only set mutations and membership reads; socket sends
/// never happen under it, so a stalled receiver cannot hold up accepts or
/// other disconnects.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, PeerRecord>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            max_connections,
        }
    }

    /// Add a new open connection. Returns the number of active connections
    /// after the insert.
    pub async fn register(&self, id: ConnectionId) -> Result<usize, RelayError> {
        let mut connections = self.connections.write().await;

        if connections.len() >= self.max_connections {
            return Err(RelayError::AtCapacity {
                limit: self.max_connections,
            });
        }

        connections.insert(
            id,
            PeerRecord {
                state: ConnectionState::Open,
                connected_at: Utc::now(),
            },
        );

        Ok(connections.len())
    }

    /// Remove a connection, yielding its record. Returns `None` if it was
    /// already gone, so a second disconnect signal for the same connection
    /// is a no-op.
    pub async fn remove(&self, id: ConnectionId) -> Option<PeerRecord> {
        let mut connections = self.connections.write().await;
        connections.remove(&id)
    }

    /// Whether the connection is present and still open.
    pub async fn is_open(&self, id: ConnectionId) -> bool {
        let connections = self.connections.read().await;
        connections
            .get(&id)
            .map(|record| record.state == ConnectionState::Open)
            .unwrap_or(false)
    }

    /// Mark every connection as closing. Used during shutdown, while close
    /// frames are still being delivered.
    pub async fn mark_closing_all(&self) {
        let mut connections = self.connections.write().await;
        for record in connections.values_mut() {
            record.state = ConnectionState::Closing;
        }
    }

    pub async fn len(&self) -> usize {
        let connections = self.connections.read().await;
        connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_remove() {
        let registry = ConnectionRegistry::new(8);
        let id = ConnectionId::new();

        assert_eq!(registry.register(id).await.unwrap(), 1);
        assert!(registry.is_open(id).await);

        let record = registry.remove(id).await.expect("record should exist");
        assert_eq!(record.state, ConnectionState::Open);
        assert!(!registry.is_open(id).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = ConnectionRegistry::new(8);
        let id = ConnectionId::new();
        registry.register(id).await.unwrap();

        // First removal wins, the second is a no-op
        assert!(registry.remove(id).await.is_some());
        assert!(registry.remove(id).await.is_none());
        assert!(registry.remove(id).await.is_none());
    }

    #[tokio::test]
    async fn register_refuses_past_capacity() {
        let registry = ConnectionRegistry::new(2);
        registry.register(ConnectionId::new()).await.unwrap();
        registry.register(ConnectionId::new()).await.unwrap();

        let err = registry.register(ConnectionId::new()).await.unwrap_err();
        assert!(matches!(err, RelayError::AtCapacity { limit: 2 }));
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn capacity_frees_up_after_remove() {
        let registry = ConnectionRegistry::new(1);
        let first = ConnectionId::new();
        registry.register(first).await.unwrap();
        assert!(registry.register(ConnectionId::new()).await.is_err());

        registry.remove(first).await;
        assert!(registry.register(ConnectionId::new()).await.is_ok());
    }

    #[tokio::test]
    async fn closing_connections_are_not_open() {
        let registry = ConnectionRegistry::new(8);
        let id = ConnectionId::new();
        registry.register(id).await.unwrap();

        registry.mark_closing_all().await;

        assert!(!registry.is_open(id).await);
        // Still present until its task removes it
        assert_eq!(registry.len().await, 1);
    }

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
    }
}
