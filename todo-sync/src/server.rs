//! WebSocket server hosting the list sync engine.
//!
//! Architecture:
//! ```text
//! Client A ──┐                     ┌── ListService ── Storage (memory | RocksDB)
//!             ├── Router ──────────┤        │
//! Client B ──┘   (per connection)  │        ├── CacheService (memory | Redis)
//!      ▲                           │        │
//!      │                           │        └── SubscriptionTracker
//!      │                           │                 │ fan-out
//!      └────── outbound queue ◄────┴── ConnectionRegistry
//! ```
//!
//! Each connection runs one task that selects between inbound WebSocket
//! frames (dispatched in arrival order) and its outbound queue. Replies to
//! the connection's own requests are written directly; only fan-out goes
//! through the bounded queue.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::cache::{CacheAdapter, CacheError, CacheService, MemoryCache, RedisCache};
use crate::config::{CacheBackend, ServerConfig, StorageConfig};
use crate::connection::{ConnectionId, ConnectionRegistry, Outbound};
use crate::report::{LogReporter, SharedReporter};
use crate::protocol::OutboundFrame;
use crate::router::Router;
use crate::service::ListService;
use crate::storage::{MemoryStorage, RocksConfig, RocksStorage, Storage, StorageError};
use crate::subscription::SubscriptionTracker;

/// How often expired in-process cache entries are swept.
const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Server start-up and accept-loop errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub fatal_errors: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_lists: usize,
}

#[derive(Default)]
struct ConnectionCounters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_frames: AtomicU64,
}

/// The list sync server.
pub struct SyncServer {
    config: ServerConfig,
    router: Arc<Router>,
    counters: Arc<ConnectionCounters>,
    /// Swept periodically while the server runs
    memory_cache: Option<Arc<MemoryCache>>,
}

impl SyncServer {
    /// Build storage and cache as configured and wire the engine.
    pub async fn build(config: ServerConfig) -> Result<Self, ServerError> {
        let reporter: SharedReporter = Arc::new(LogReporter);

        let storage: Arc<dyn Storage> = match &config.storage {
            StorageConfig::Memory => {
                log::warn!("Using in-memory storage; lists are lost on restart");
                Arc::new(MemoryStorage::new())
            }
            StorageConfig::Rocks { path } => Arc::new(RocksStorage::open(RocksConfig::at(path))?),
        };

        let mut memory_cache = None;
        let adapter: Arc<dyn CacheAdapter> = match &config.cache.backend {
            CacheBackend::Memory => {
                let cache = Arc::new(MemoryCache::new());
                memory_cache = Some(cache.clone());
                cache
            }
            CacheBackend::Redis { host, port } => {
                Arc::new(RedisCache::connect(&crate::cache::redis::redis_url(host, *port)).await?)
            }
        };
        let cache = Arc::new(CacheService::new(adapter, config.cache.ttl_secs, reporter.clone()));

        let mut server = Self::with_components(config, storage, cache, reporter);
        server.memory_cache = memory_cache;
        Ok(server)
    }

    /// In-memory storage and cache, no I/O at construction.
    pub fn in_memory(config: ServerConfig) -> Self {
        let reporter: SharedReporter = Arc::new(LogReporter);
        let cache = Arc::new(CacheService::new(
            Arc::new(MemoryCache::new()),
            config.cache.ttl_secs,
            reporter.clone(),
        ));
        Self::with_components(config, Arc::new(MemoryStorage::new()), cache, reporter)
    }

    /// Wire the engine around the given collaborators.
    pub fn with_components(
        config: ServerConfig,
        storage: Arc<dyn Storage>,
        cache: Arc<CacheService>,
        reporter: SharedReporter,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.outbound_capacity));
        let tracker = Arc::new(SubscriptionTracker::new(registry.clone()));
        let service = Arc::new(ListService::new(storage, cache, tracker, reporter.clone()));
        let router = Arc::new(Router::new(service, registry, reporter));

        Self {
            config,
            router,
            counters: Arc::new(ConnectionCounters::default()),
            memory_cache: None,
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("List sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        if let Some(cache) = self.memory_cache.clone() {
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(CACHE_PURGE_INTERVAL);
                loop {
                    ticker.tick().await;
                    let purged = cache.purge_expired().await;
                    if purged > 0 {
                        log::debug!("Purged {purged} expired cache entries");
                    }
                }
            });
        }

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let router = self.router.clone();
            let counters = self.counters.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, router, counters).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        router: Arc<Router>,
        counters: Arc<ConnectionCounters>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let registry = router.registry().clone();
        let (conn, mut outbound) = registry.register().await;
        counters.total_connections.fetch_add(1, Ordering::Relaxed);
        counters.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("WebSocket connection {conn} established from {addr}");

        let result: Result<(), tokio_tungstenite::tungstenite::Error> = async {
            loop {
                tokio::select! {
                    // Incoming WebSocket message
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                counters.total_frames.fetch_add(1, Ordering::Relaxed);
                                let outcome = router.dispatch(conn, text.as_str()).await;
                                let mut close = outcome.is_close();
                                if let Some(reply) = outcome.reply() {
                                    // Fan-out queued by this request goes first.
                                    close |= flush_queued(&mut outbound, &mut ws_sender).await?;
                                    send_reply(&mut ws_sender, conn, reply).await?;
                                }
                                if close {
                                    ws_sender.send(Message::Close(None)).await?;
                                    break;
                                }
                            }
                            Some(Ok(Message::Binary(_))) => {
                                log::warn!("Ignoring binary frame from {conn}");
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection {conn} closed by {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }

                    // Outgoing responses and broadcasts
                    out = outbound.recv() => {
                        match out {
                            Some(Outbound::Text(text)) => {
                                ws_sender.send(Message::text(text.to_string())).await?;
                            }
                            Some(Outbound::Close) | None => {
                                ws_sender.send(Message::Close(None)).await?;
                                break;
                            }
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        // Cleanup runs on every exit path.
        registry.unregister(&conn).await;
        router.service().handle_disconnect(&conn).await;
        counters.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection {conn} from {addr} cleaned up");

        result.map_err(Into::into)
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let registry = self.router.registry().stats().await;
        let tracker = self.router.service().tracker().stats().await;
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            total_frames: self.counters.total_frames.load(Ordering::Relaxed),
            fatal_errors: self.router.fatal_errors(),
            messages_sent: registry.messages_sent,
            messages_dropped: registry.messages_dropped,
            active_lists: tracker.active_lists,
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Write out frames already queued for the connection without waiting.
/// Returns whether a close was queued among them.
async fn flush_queued(
    outbound: &mut mpsc::Receiver<Outbound>,
    ws_sender: &mut WsSink,
) -> Result<bool, tungstenite::Error> {
    while let Ok(out) = outbound.try_recv() {
        match out {
            Outbound::Text(text) => ws_sender.send(Message::text(text.to_string())).await?,
            Outbound::Close => return Ok(true),
        }
    }
    Ok(false)
}

async fn send_reply(
    ws_sender: &mut WsSink,
    conn: ConnectionId,
    reply: &OutboundFrame,
) -> Result<(), tungstenite::Error> {
    match reply.encode() {
        Ok(text) => ws_sender.send(Message::text(text)).await,
        Err(e) => {
            log::error!("Failed to encode reply {} for {conn}: {e}", reply.id);
            Ok(())
        }
    }
}
