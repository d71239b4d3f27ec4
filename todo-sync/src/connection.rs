//! Registry of live connections and their outbound queues.
//!
//! Each connection owns a bounded queue drained by its socket task. The
//! queue carries fan-out only; replies to a connection's own requests are
//! written by its socket task directly. Sends never block: a full queue
//! drops the frame, a stale handle is a logged no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Opaque handle of one transport session.
pub type ConnectionId = Uuid;

/// Default per-connection queue depth.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Work for a connection's socket task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Encoded frame, shared between all recipients of a fan-out.
    Text(Arc<str>),
    /// Close the transport after flushing what is queued before it.
    Close,
}

/// Statistics for monitoring delivery health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub delivery_failures: u64,
    pub active_connections: usize,
}

#[derive(Default)]
struct AtomicRegistryStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    delivery_failures: AtomicU64,
}

/// Live connections keyed by handle.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, mpsc::Sender<Outbound>>>,
    capacity: usize,
    stats: AtomicRegistryStats,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOUND_CAPACITY)
    }
}

impl ConnectionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            stats: AtomicRegistryStats::default(),
        }
    }

    /// Register a new connection. The receiver feeds its socket task.
    pub async fn register(&self) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = Uuid::new_v4();
        self.connections.write().await.insert(id, tx);
        log::debug!("Connection {id} registered");
        (id, rx)
    }

    /// Forget a connection. Returns whether it was known.
    pub async fn unregister(&self, id: &ConnectionId) -> bool {
        let removed = self.connections.write().await.remove(id).is_some();
        if removed {
            log::debug!("Connection {id} unregistered");
        }
        removed
    }

    /// Queue an encoded frame for `id`. Returns whether it was queued.
    pub async fn send(&self, id: &ConnectionId, text: Arc<str>) -> bool {
        let sender = self.connections.read().await.get(id).cloned();
        let Some(sender) = sender else {
            self.stats.delivery_failures.fetch_add(1, Ordering::Relaxed);
            log::warn!("Delivery to {id} failed: connection is gone");
            return false;
        };

        match sender.try_send(Outbound::Text(text)) {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Outbound queue of {id} is full, frame dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.delivery_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("Delivery to {id} failed: connection is closing");
                false
            }
        }
    }

    /// Ask the socket task of `id` to close, then forget the connection.
    ///
    /// Frames queued before the close are still flushed.
    pub async fn disconnect(&self, id: &ConnectionId) {
        let sender = self.connections.write().await.remove(id);
        match sender {
            Some(sender) => {
                if sender.try_send(Outbound::Close).is_err() {
                    // Dropping the last sender closes the queue, which ends
                    // the socket task all the same.
                    log::debug!("Close for {id} not queued, dropping its queue");
                }
                log::info!("Connection {id} disconnected by server");
            }
            None => log::debug!("Disconnect of unknown connection {id}"),
        }
    }

    pub async fn is_connected(&self, id: &ConnectionId) -> bool {
        self.connections.read().await.contains_key(id)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            delivery_failures: self.stats.delivery_failures.load(Ordering::Relaxed),
            active_connections: self.connection_count().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Arc<str> {
        Arc::from(s)
    }

    #[tokio::test]
    async fn test_register_send_receive() {
        let registry = ConnectionRegistry::new(4);
        let (id, mut rx) = registry.register().await;
        assert!(registry.is_connected(&id).await);

        assert!(registry.send(&id, text("hello")).await);
        assert_eq!(rx.recv().await, Some(Outbound::Text(text("hello"))));
        assert_eq!(registry.stats().await.messages_sent, 1);
    }

    #[tokio::test]
    async fn test_send_to_stale_handle_is_a_noop() {
        let registry = ConnectionRegistry::default();
        let (id, _rx) = registry.register().await;
        assert!(registry.unregister(&id).await);
        assert!(!registry.unregister(&id).await);

        assert!(!registry.send(&id, text("late")).await);
        assert!(!registry.send(&Uuid::new_v4(), text("nobody")).await);
        assert_eq!(registry.stats().await.delivery_failures, 2);
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped() {
        let registry = ConnectionRegistry::default();
        let (id, rx) = registry.register().await;
        drop(rx);

        assert!(!registry.send(&id, text("x")).await);
        assert_eq!(registry.stats().await.delivery_failures, 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let registry = ConnectionRegistry::new(2);
        let (id, mut rx) = registry.register().await;

        assert!(registry.send(&id, text("1")).await);
        assert!(registry.send(&id, text("2")).await);
        assert!(!registry.send(&id, text("3")).await);

        let stats = registry.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_dropped, 1);

        assert_eq!(rx.recv().await, Some(Outbound::Text(text("1"))));
        assert!(registry.send(&id, text("4")).await);
    }

    #[tokio::test]
    async fn test_disconnect_flushes_then_closes() {
        let registry = ConnectionRegistry::new(4);
        let (id, mut rx) = registry.register().await;

        registry.send(&id, text("bye")).await;
        registry.disconnect(&id).await;

        assert!(!registry.is_connected(&id).await);
        assert_eq!(rx.recv().await, Some(Outbound::Text(text("bye"))));
        assert_eq!(rx.recv().await, Some(Outbound::Close));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_connection_count() {
        let registry = ConnectionRegistry::default();
        let (a, _rx_a) = registry.register().await;
        let (_b, _rx_b) = registry.register().await;
        assert_eq!(registry.connection_count().await, 2);

        registry.unregister(&a).await;
        assert_eq!(registry.stats().await.active_connections, 1);
    }
}
