//! # todo-sync: Real-time shared todo lists
//!
//! Clients connect over WebSocket, create or open a list by its public
//! UUID and edit its items. Every saved or deleted item is fanned out to
//! all connections currently viewing that list.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ ListClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     JSON frames     │ (central)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │  ListService  │
//!                                    └───┬───────┬───┘
//!                                        │       │
//!                              Storage ◄─┘       └─► SubscriptionTracker
//!                          (memory | RocksDB)         (fan-out per list)
//! ```
//!
//! Items form a forest: `parentId` nests an item, `afterId` chains it
//! behind its predecessor among siblings. See [`ordering`].
//!
//! ## Modules
//!
//! - [`protocol`]: JSON envelope and request payloads
//! - [`router`]: Inbound frame dispatch and error replies
//! - [`service`]: List operations
//! - [`ordering`]: Tree building, cascade delete and relinking
//! - [`subscription`]: One viewed list per connection, fan-out
//! - [`cache`]: Read-through cache over memory or Redis
//! - [`storage`]: Persistence over memory or RocksDB
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client with request timeouts

pub mod cache;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod model;
pub mod ordering;
pub mod protocol;
pub mod report;
pub mod router;
pub mod server;
pub mod service;
pub mod storage;
pub mod subscription;

// Re-exports for convenience
pub use cache::{CacheAdapter, CacheError, CacheService, MemoryCache, RedisCache};
pub use client::{ClientError, ListClient, ListEvent};
pub use config::{CacheBackend, ConfigError, ServerConfig, StorageConfig};
pub use connection::{ConnectionId, ConnectionRegistry};
pub use error::{ErrorCode, SyncError};
pub use model::{Item, ItemBroadcast, ItemDraft, ItemId, List, ListId, NestedItem, NestedList};
pub use ordering::{build_tree, cascade_delete, relink_after_delete, StructuralCorruption};
pub use protocol::{InboundFrame, OutboundFrame, ProtocolError};
pub use server::{ServerError, ServerStats, SyncServer};
pub use service::ListService;
pub use storage::{MemoryStorage, RocksConfig, RocksStorage, Storage, StorageError};
pub use subscription::SubscriptionTracker;
