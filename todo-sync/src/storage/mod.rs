//! Persistence collaborator for lists and items.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   create / find / save / delete   ┌───────────────┐
//! │ ListService │ ────────────────────────────────► │ dyn Storage   │
//! └─────────────┘          commit(ChangeSet)        └───────┬───────┘
//!                                                           │
//!                                ┌──────────────────────────┼─────────────────────┐
//!                                ▼                                                ▼
//!                        ┌───────────────┐                  ┌──────────────────────────────────┐
//!                        │ MemoryStorage │                  │ RocksStorage                     │
//!                        │ (one lock)    │                  │ CF "lists"      list rows        │
//!                        └───────────────┘                  │ CF "items"      item rows        │
//!                                                           │ CF "item_index" item → list      │
//!                                                           │ CF "meta"       id sequences     │
//!                                                           └──────────────────────────────────┘
//! ```
//!
//! Every backend guarantees read-your-writes: once a write returns `Ok`,
//! the next `find_list` observes it.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStorage;
pub use rocks::{RocksConfig, RocksStorage};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{Item, ItemId, ItemWrite, List, ListId};

/// Storage errors. All of them are fatal to the requesting connection.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Item {0} does not exist in list {1}")]
    MissingItem(ItemId, ListId),
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// Deletions and saves applied together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub deletes: Vec<ItemId>,
    pub saves: Vec<ItemWrite>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.saves.is_empty()
    }
}

/// CRUD contract consumed by the list service.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Persist a new, empty list.
    async fn create_list(&self) -> Result<List, StorageError>;

    /// Look a list up by its public id, optionally with its flat item rows.
    async fn find_list(&self, public_id: &Uuid, with_items: bool)
        -> Result<Option<List>, StorageError>;

    /// Insert (`item.id == None`) or update an item of `list_id`.
    ///
    /// Updates keep the stored `created_at`.
    async fn save_item(&self, list_id: ListId, item: ItemWrite) -> Result<Item, StorageError>;

    /// Remove items by id. Unknown ids are ignored.
    async fn delete_items(&self, ids: &[ItemId]) -> Result<(), StorageError>;

    /// Apply `changes` to `list_id`, deletions first, returning the saved
    /// rows in order.
    ///
    /// The default is not atomic; backends that can apply both halves in one
    /// write override it.
    async fn commit(&self, list_id: ListId, changes: ChangeSet) -> Result<Vec<Item>, StorageError> {
        if !changes.deletes.is_empty() {
            self.delete_items(&changes.deletes).await?;
        }
        let mut saved = Vec::with_capacity(changes.saves.len());
        for write in changes.saves {
            saved.push(self.save_item(list_id, write).await?);
        }
        Ok(saved)
    }
}
