//! List subscriptions and fan-out.
//!
//! A connection watches at most one list. Subscribing to another list
//! silently revokes the previous subscription.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::connection::{ConnectionId, ConnectionRegistry};
use crate::protocol::{OutboundFrame, ProtocolError};

#[derive(Default)]
struct Subscriptions {
    by_list: HashMap<Uuid, HashSet<ConnectionId>>,
    by_connection: HashMap<ConnectionId, Uuid>,
}

impl Subscriptions {
    fn remove(&mut self, connection: &ConnectionId) -> Option<Uuid> {
        let list = self.by_connection.remove(connection)?;
        if let Some(set) = self.by_list.get_mut(&list) {
            set.remove(connection);
            if set.is_empty() {
                self.by_list.remove(&list);
            }
        }
        Some(list)
    }
}

/// Statistics for monitoring fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub fanouts: u64,
    pub deliveries: u64,
    pub active_lists: usize,
    pub subscribers: usize,
}

/// Maps list public ids to the connections watching them.
///
/// Every map mutation happens under one coarse lock; fan-out takes a
/// snapshot of the subscriber set and sends without holding it.
pub struct SubscriptionTracker {
    registry: Arc<ConnectionRegistry>,
    subscriptions: RwLock<Subscriptions>,
    fanouts: AtomicU64,
    deliveries: AtomicU64,
}

impl SubscriptionTracker {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            subscriptions: RwLock::new(Subscriptions::default()),
            fanouts: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Make `list` the only list `connection` watches.
    pub async fn subscribe(&self, list: Uuid, connection: ConnectionId) {
        let mut subs = self.subscriptions.write().await;
        if let Some(previous) = subs.remove(&connection) {
            if previous != list {
                log::debug!("Connection {connection} left list {previous}");
            }
        }
        subs.by_list.entry(list).or_default().insert(connection);
        subs.by_connection.insert(connection, list);
        log::debug!("Connection {connection} subscribed to list {list}");
    }

    /// Drop whatever subscription `connection` holds.
    pub async fn unsubscribe(&self, connection: &ConnectionId) -> Option<Uuid> {
        let removed = self.subscriptions.write().await.remove(connection);
        if let Some(list) = removed {
            log::debug!("Connection {connection} unsubscribed from list {list}");
        }
        removed
    }

    /// The list `connection` currently watches.
    pub async fn subscription_of(&self, connection: &ConnectionId) -> Option<Uuid> {
        self.subscriptions
            .read()
            .await
            .by_connection
            .get(connection)
            .copied()
    }

    pub async fn subscribers(&self, list: &Uuid) -> Vec<ConnectionId> {
        self.subscriptions
            .read()
            .await
            .by_list
            .get(list)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Best-effort delivery of `frame` to every subscriber of `list`.
    ///
    /// The frame is encoded once. Subscribers that vanish mid-fanout are
    /// skipped. Returns the number of connections the frame was queued for.
    pub async fn fanout(&self, list: &Uuid, frame: &OutboundFrame) -> Result<usize, ProtocolError> {
        let encoded: Arc<str> = Arc::from(frame.encode()?);
        let targets = self.subscribers(list).await;

        let mut delivered = 0;
        for connection in &targets {
            if self.registry.send(connection, encoded.clone()).await {
                delivered += 1;
            }
        }

        self.fanouts.fetch_add(1, Ordering::Relaxed);
        self.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        log::debug!(
            "Fan-out of {} on list {list}: {delivered}/{} delivered",
            frame.kind,
            targets.len()
        );
        Ok(delivered)
    }

    pub async fn active_lists(&self) -> usize {
        self.subscriptions.read().await.by_list.len()
    }

    pub async fn stats(&self) -> TrackerStats {
        let subs = self.subscriptions.read().await;
        TrackerStats {
            fanouts: self.fanouts.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            active_lists: subs.by_list.len(),
            subscribers: subs.by_connection.len(),
        }
    }
}
