//! Cart broadcast relay core.
//!
//! Owns the set of live connections and the fan-out channel. Every payload
//! received from one connection is forwarded verbatim to all other open
//! connections; the relay never parses, validates, or stores message
//! content. There is no history: a connection that joins late starts
//! receiving from its join point onward.

mod registry;

pub use registry::{ConnectionId, ConnectionRegistry, ConnectionState, PeerRecord};

use thiserror::Error;
use tokio::sync::{broadcast, watch};

use crate::config::RelayConfig;

/// A message payload exactly as it arrived on the wire. Text stays text,
/// binary stays binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

/// One fan-out unit: the payload plus the connection that produced it, so
/// receivers can drop their own messages instead of hearing an echo.
#[derive(Debug, Clone)]
pub struct Frame {
    pub sender: ConnectionId,
    pub payload: Payload,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("connection limit reached ({limit} active)")]
    AtCapacity { limit: usize },
    #[error("relay is shutting down")]
    ShuttingDown,
}

/// Handle returned to the transport layer for one accepted connection.
///
/// `frames` yields every broadcast from the moment of acceptance; nothing
/// sent earlier is replayed. `shutdown` flips to `true` when the relay is
/// closing all connections.
#[derive(Debug)]
pub struct PeerSession {
    pub id: ConnectionId,
    pub frames: broadcast::Receiver<Frame>,
    pub shutdown: watch::Receiver<bool>,
}

/// The relay itself: connection set plus fan-out channel.
///
/// Fan-out rides a single bounded broadcast channel, which gives two
/// properties for free: publish order is preserved at every receiver
/// (a superset of per-sender FIFO), and a receiver that falls more than
/// `broadcast_capacity` messages behind observes `Lagged` and gets
/// disconnected instead of queueing without bound.
pub struct Relay {
    registry: ConnectionRegistry,
    tx: broadcast::Sender<Frame>,
    shutdown_tx: watch::Sender<bool>,
}

impl Relay {
    pub fn new(config: &RelayConfig) -> Self {
        let (tx, _) = broadcast::channel(config.broadcast_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            registry: ConnectionRegistry::new(config.max_connections),
            tx,
            shutdown_tx,
        }
    }

    /// Register a newly upgraded connection and subscribe it to the fan-out
    /// channel. Refused when the connection set is full or the relay is
    /// shutting down; either way existing connections are unaffected.
    pub async fn accept(&self) -> Result<PeerSession, RelayError> {
        if *self.shutdown_tx.borrow() {
            return Err(RelayError::ShuttingDown);
        }

        let id = ConnectionId::new();
        let active = self.registry.register(id).await?;
        tracing::info!(connection = %id, active, "Client connected");

        Ok(PeerSession {
            id,
            frames: self.tx.subscribe(),
            shutdown: self.shutdown_tx.subscribe(),
        })
    }

    /// Enqueue a payload for delivery to every other open connection.
    /// Returns the number of peers the frame was queued for.
    ///
    /// Messages from connections that are no longer open (already removed,
    /// or closing during shutdown) are dropped.
    pub async fn publish(&self, sender: ConnectionId, payload: Payload) -> usize {
        if !self.registry.is_open(sender).await {
            tracing::debug!(connection = %sender, "Dropping message from non-open connection");
            return 0;
        }

        match self.tx.send(Frame { sender, payload }) {
            // The sender's own subscription is not a delivery target
            Ok(receivers) => receivers.saturating_sub(1),
            // No live subscribers at all; nothing to deliver
            Err(_) => 0,
        }
    }

    /// Remove a connection from the set. Idempotent: concurrent disconnect
    /// signals for the same connection resolve to a single removal.
    pub async fn disconnect(&self, id: ConnectionId) -> bool {
        match self.registry.remove(id).await {
            Some(record) => {
                let session_secs = (chrono::Utc::now() - record.connected_at).num_seconds();
                let active = self.registry.len().await;
                tracing::info!(
                    connection = %id,
                    active,
                    session_secs,
                    "Client disconnected"
                );
                true
            }
            None => false,
        }
    }

    /// Begin shutdown: mark every connection as closing and signal their
    /// tasks to deliver close frames and exit. New accepts are refused from
    /// this point on.
    pub async fn shutdown(&self) {
        self.registry.mark_closing_all().await;
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.len().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    fn test_config() -> RelayConfig {
        RelayConfig {
            max_connections: 8,
            broadcast_capacity: 16,
            send_timeout_secs: 5,
        }
    }

    fn text(s: &str) -> Payload {
        Payload::Text(s.to_string())
    }

    #[tokio::test]
    async fn publish_reaches_every_other_connection() {
        let relay = Relay::new(&test_config());
        let a = relay.accept().await.unwrap();
        let mut b = relay.accept().await.unwrap();
        let mut c = relay.accept().await.unwrap();

        let delivered = relay.publish(a.id, text("cart")).await;
        assert_eq!(delivered, 2);

        for rx in [&mut b.frames, &mut c.frames] {
            let frame = rx.try_recv().unwrap();
            assert_eq!(frame.sender, a.id);
            assert_eq!(frame.payload, text("cart"));
        }
    }

    #[tokio::test]
    async fn frames_carry_sender_for_echo_suppression() {
        let relay = Relay::new(&test_config());
        let mut a = relay.accept().await.unwrap();
        let _b = relay.accept().await.unwrap();

        relay.publish(a.id, text("m")).await;

        // The channel fans out to every subscriber including the sender;
        // the transport edge filters on the sender id carried in the frame.
        let frame = a.frames.try_recv().unwrap();
        assert_eq!(frame.sender, a.id);
    }

    #[tokio::test]
    async fn per_sender_order_is_preserved() {
        let relay = Relay::new(&test_config());
        let a = relay.accept().await.unwrap();
        let mut b = relay.accept().await.unwrap();

        for i in 0..10 {
            relay.publish(a.id, text(&format!("m{}", i))).await;
        }

        for i in 0..10 {
            let frame = b.frames.try_recv().unwrap();
            assert_eq!(frame.payload, text(&format!("m{}", i)));
        }
    }

    #[tokio::test]
    async fn late_join_gets_no_history() {
        let relay = Relay::new(&test_config());
        let a = relay.accept().await.unwrap();
        let _b = relay.accept().await.unwrap();

        relay.publish(a.id, text("before")).await;

        let mut d = relay.accept().await.unwrap();
        assert!(matches!(d.frames.try_recv(), Err(TryRecvError::Empty)));

        relay.publish(a.id, text("after")).await;
        assert_eq!(d.frames.try_recv().unwrap().payload, text("after"));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let relay = Relay::new(&test_config());
        let a = relay.accept().await.unwrap();

        assert!(relay.disconnect(a.id).await);
        assert!(!relay.disconnect(a.id).await);
        assert_eq!(relay.connection_count().await, 0);
    }

    #[tokio::test]
    async fn publish_from_removed_connection_is_dropped() {
        let relay = Relay::new(&test_config());
        let a = relay.accept().await.unwrap();
        let mut b = relay.accept().await.unwrap();

        relay.disconnect(a.id).await;

        assert_eq!(relay.publish(a.id, text("stale")).await, 0);
        assert!(matches!(b.frames.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn accept_refused_at_capacity() {
        let config = RelayConfig {
            max_connections: 2,
            ..test_config()
        };
        let relay = Relay::new(&config);
        let _a = relay.accept().await.unwrap();
        let _b = relay.accept().await.unwrap();

        let err = relay.accept().await.unwrap_err();
        assert!(matches!(err, RelayError::AtCapacity { limit: 2 }));
        assert_eq!(relay.connection_count().await, 2);
    }

    #[tokio::test]
    async fn slow_receiver_observes_lag_instead_of_unbounded_queue() {
        let config = RelayConfig {
            broadcast_capacity: 4,
            ..test_config()
        };
        let relay = Relay::new(&config);
        let a = relay.accept().await.unwrap();
        let mut b = relay.accept().await.unwrap();

        // b never drains while a bursts well past the queue depth
        for i in 0..20 {
            relay.publish(a.id, text(&format!("m{}", i))).await;
        }

        assert!(matches!(b.frames.recv().await, Err(RecvError::Lagged(_))));
    }

    #[tokio::test]
    async fn shutdown_refuses_new_accepts_and_signals_peers() {
        let relay = Relay::new(&test_config());
        let a = relay.accept().await.unwrap();
        let mut shutdown = a.shutdown;

        relay.shutdown().await;

        assert!(matches!(relay.accept().await, Err(RelayError::ShuttingDown)));
        shutdown.changed().await.unwrap();
        assert!(*shutdown.borrow());

        // Closing connections no longer broadcast
        assert_eq!(relay.publish(a.id, text("late")).await, 0);
    }
}
