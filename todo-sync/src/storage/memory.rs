//! In-process storage backend.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ChangeSet, Storage, StorageError};
use crate::model::{now_millis, Item, ItemId, ItemWrite, List, ListId};

#[derive(Default)]
struct State {
    next_list_id: ListId,
    next_item_id: ItemId,
    lists: HashMap<Uuid, List>,
    items: BTreeMap<ItemId, Item>,
}

impl State {
    fn save(&mut self, list_id: ListId, write: ItemWrite) -> Result<Item, StorageError> {
        let (id, created_at) = match write.id {
            Some(id) => match self.items.get(&id) {
                Some(existing) if existing.list_id == list_id => (id, existing.created_at),
                _ => return Err(StorageError::MissingItem(id, list_id)),
            },
            None => {
                self.next_item_id += 1;
                (self.next_item_id, now_millis())
            }
        };
        let item = Item {
            id,
            name: write.name,
            cost: write.cost,
            done: write.done,
            parent_id: write.parent_id,
            after_id: write.after_id,
            list_id,
            created_at,
        };
        self.items.insert(id, item.clone());
        Ok(item)
    }
}

/// Lists and items held in memory behind one lock. Data does not survive
/// the process.
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<State>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored items across all lists.
    pub async fn item_count(&self) -> usize {
        self.state.lock().await.items.len()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_list(&self) -> Result<List, StorageError> {
        let mut state = self.state.lock().await;
        state.next_list_id += 1;
        let list = List::new(state.next_list_id);
        state.lists.insert(list.public_id, list.clone());
        Ok(list)
    }

    async fn find_list(
        &self,
        public_id: &Uuid,
        with_items: bool,
    ) -> Result<Option<List>, StorageError> {
        let state = self.state.lock().await;
        let Some(list) = state.lists.get(public_id) else {
            return Ok(None);
        };
        let mut list = list.clone();
        if with_items {
            list.items = state
                .items
                .values()
                .filter(|item| item.list_id == list.id)
                .cloned()
                .collect();
        }
        Ok(Some(list))
    }

    async fn save_item(&self, list_id: ListId, item: ItemWrite) -> Result<Item, StorageError> {
        self.state.lock().await.save(list_id, item)
    }

    async fn delete_items(&self, ids: &[ItemId]) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        for id in ids {
            state.items.remove(id);
        }
        Ok(())
    }

    async fn commit(&self, list_id: ListId, changes: ChangeSet) -> Result<Vec<Item>, StorageError> {
        let mut state = self.state.lock().await;

        // Validate before touching anything so a failed commit leaves no trace.
        for write in &changes.saves {
            if let Some(id) = write.id {
                let owned = state.items.get(&id).is_some_and(|i| i.list_id == list_id);
                if !owned || changes.deletes.contains(&id) {
                    return Err(StorageError::MissingItem(id, list_id));
                }
            }
        }

        for id in &changes.deletes {
            state.items.remove(id);
        }
        changes
            .saves
            .into_iter()
            .map(|write| state.save(list_id, write))
            .collect()
    }
}
