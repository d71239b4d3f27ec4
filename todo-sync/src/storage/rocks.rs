//! RocksDB-backed persistent list store.
//!
//! Column families:
//! - `lists`: List rows, keyed by public id (16 bytes)
//! - `items`: Item rows, keyed by `<list_id:8 BE><item_id:8 BE>` for prefix scans
//! - `item_index`: Item id → owning list id, for deletes by item id
//! - `meta`: Id sequences (`next_list_id`, `next_item_id`)
//!
//! Every mutation is one `WriteBatch`, sequence bumps included, so a crash
//! never leaves a row behind without its index entry or a reused id.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ChangeSet, Storage, StorageError};
use crate::model::{now_millis, Item, ItemId, ItemWrite, List, ListId};

const CF_LISTS: &str = "lists";
const CF_ITEMS: &str = "items";
const CF_ITEM_INDEX: &str = "item_index";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_LISTS, CF_ITEMS, CF_ITEM_INDEX, CF_META];

const KEY_NEXT_LIST_ID: &[u8] = b"next_list_id";
const KEY_NEXT_ITEM_ID: &[u8] = b"next_item_id";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("todo_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl RocksConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ListRow {
    id: ListId,
    public_id: Uuid,
    name: String,
    created_at: u64,
    deleted_at: Option<u64>,
}

/// Item as stored on disk. Cost is kept as its decimal text.
#[derive(Debug, Serialize, Deserialize)]
struct ItemRow {
    id: ItemId,
    name: String,
    cost: Option<String>,
    done: bool,
    parent_id: Option<ItemId>,
    after_id: Option<ItemId>,
    list_id: ListId,
    created_at: u64,
}

impl From<&Item> for ItemRow {
    fn from(item: &Item) -> Self {
        Self {
            id: item.id,
            name: item.name.clone(),
            cost: item.cost.map(|c| c.to_string()),
            done: item.done,
            parent_id: item.parent_id,
            after_id: item.after_id,
            list_id: item.list_id,
            created_at: item.created_at,
        }
    }
}

impl TryFrom<ItemRow> for Item {
    type Error = StorageError;

    fn try_from(row: ItemRow) -> Result<Self, Self::Error> {
        let cost = row
            .cost
            .map(|c| Decimal::from_str(&c))
            .transpose()
            .map_err(|e| StorageError::Serialization(format!("cost of item {}: {e}", row.id)))?;
        Ok(Item {
            id: row.id,
            name: row.name,
            cost,
            done: row.done,
            parent_id: row.parent_id,
            after_id: row.after_id,
            list_id: row.list_id,
            created_at: row.created_at,
        })
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(value)
}

fn read_u64(bytes: &[u8]) -> Option<u64> {
    let buf: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(buf))
}

/// Key of an item row: list id (8 bytes BE) + item id (8 bytes BE).
fn item_key(list_id: ListId, item_id: ItemId) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&list_id.to_be_bytes());
    key.extend_from_slice(&item_id.to_be_bytes());
    key
}

/// Next id values, staged in memory and written with the batch that uses them.
struct Sequences {
    next_list_id: u64,
    next_item_id: u64,
}

/// RocksDB-backed list store.
pub struct RocksStorage {
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksConfig,
    /// Serializes read-modify-write cycles and guards the id sequences.
    sequences: Mutex<Sequences>,
}

impl RocksStorage {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: RocksConfig) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequences = Self::recover_sequences(&db)?;
        log::info!(
            "Opened list store at {} (next list id {}, next item id {})",
            config.path.display(),
            sequences.next_list_id,
            sequences.next_item_id
        );

        Ok(Self {
            db,
            config,
            sequences: Mutex::new(sequences),
        })
    }

    fn cf_options(name: &str, config: &RocksConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_ITEMS => {
                // Rows of one list share an 8-byte prefix.
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(8));
            }
            CF_LISTS | CF_ITEM_INDEX | CF_META => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }
        opts
    }

    fn recover_sequences(db: &DBWithThreadMode<SingleThreaded>) -> Result<Sequences, StorageError> {
        let cf = db
            .cf_handle(CF_META)
            .ok_or_else(|| StorageError::Database(format!("Column family '{CF_META}' not found")))?;
        let read = |key: &[u8]| -> Result<u64, StorageError> {
            Ok(db.get_cf(&cf, key)?.as_deref().and_then(read_u64).unwrap_or(1))
        };
        Ok(Sequences {
            next_list_id: read(KEY_NEXT_LIST_ID)?,
            next_item_id: read(KEY_NEXT_ITEM_ID)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Force memtables to disk.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Database(format!("Column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn load_items(&self, list_id: ListId) -> Result<Vec<Item>, StorageError> {
        let cf = self.cf(CF_ITEMS)?;
        let prefix = list_id.to_be_bytes();
        let mut items = Vec::new();

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for entry in iter {
            let (key, value) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            items.push(Item::try_from(decode::<ItemRow>(&value)?)?);
        }
        Ok(items)
    }

    fn load_item(&self, list_id: ListId, item_id: ItemId) -> Result<Option<Item>, StorageError> {
        let cf = self.cf(CF_ITEMS)?;
        match self.db.get_cf(&cf, item_key(list_id, item_id))? {
            Some(bytes) => Ok(Some(Item::try_from(decode::<ItemRow>(&bytes)?)?)),
            None => Ok(None),
        }
    }

    fn owning_list(&self, item_id: ItemId) -> Result<Option<ListId>, StorageError> {
        let cf = self.cf(CF_ITEM_INDEX)?;
        Ok(self
            .db
            .get_cf(&cf, item_id.to_be_bytes())?
            .as_deref()
            .and_then(read_u64))
    }

    /// Stage the deletion of `item_id` (row and index entry) into `batch`.
    fn stage_delete(&self, batch: &mut WriteBatch, item_id: ItemId) -> Result<(), StorageError> {
        if let Some(list_id) = self.owning_list(item_id)? {
            let cf_items = self.cf(CF_ITEMS)?;
            let cf_index = self.cf(CF_ITEM_INDEX)?;
            batch.delete_cf(&cf_items, item_key(list_id, item_id));
            batch.delete_cf(&cf_index, item_id.to_be_bytes());
        }
        Ok(())
    }

    /// Resolve `write` into a full row and stage it into `batch`.
    fn stage_save(
        &self,
        batch: &mut WriteBatch,
        seq: &mut Sequences,
        list_id: ListId,
        write: ItemWrite,
        deleted: &[ItemId],
    ) -> Result<Item, StorageError> {
        let (id, created_at) = match write.id {
            Some(id) => match self.load_item(list_id, id)? {
                Some(existing) if !deleted.contains(&id) => (id, existing.created_at),
                _ => return Err(StorageError::MissingItem(id, list_id)),
            },
            None => {
                let id = seq.next_item_id as ItemId;
                seq.next_item_id += 1;
                (id, now_millis())
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
        let cf_items = self.cf(CF_ITEMS)?;
        let cf_index = self.cf(CF_ITEM_INDEX)?;
        batch.put_cf(&cf_items, item_key(list_id, id), encode(&ItemRow::from(&item))?);
        batch.put_cf(&cf_index, id.to_be_bytes(), list_id.to_be_bytes());
        Ok(item)
    }

    fn stage_sequences(&self, batch: &mut WriteBatch, seq: &Sequences) -> Result<(), StorageError> {
        let cf = self.cf(CF_META)?;
        batch.put_cf(&cf, KEY_NEXT_LIST_ID, seq.next_list_id.to_be_bytes());
        batch.put_cf(&cf, KEY_NEXT_ITEM_ID, seq.next_item_id.to_be_bytes());
        Ok(())
    }
}

#[async_trait]
impl Storage for RocksStorage {
    async fn create_list(&self) -> Result<List, StorageError> {
        let mut seq = self.sequences.lock().await;
        let staged = Sequences {
            next_list_id: seq.next_list_id + 1,
            next_item_id: seq.next_item_id,
        };
        let list = List::new(seq.next_list_id);
        let row = ListRow {
            id: list.id,
            public_id: list.public_id,
            name: list.name.clone(),
            created_at: list.created_at,
            deleted_at: list.deleted_at,
        };

        let mut batch = WriteBatch::default();
        let cf_lists = self.cf(CF_LISTS)?;
        batch.put_cf(&cf_lists, list.public_id.as_bytes(), encode(&row)?);
        self.stage_sequences(&mut batch, &staged)?;
        self.write(batch)?;

        *seq = staged;
        Ok(list)
    }

    async fn find_list(
        &self,
        public_id: &Uuid,
        with_items: bool,
    ) -> Result<Option<List>, StorageError> {
        let cf = self.cf(CF_LISTS)?;
        let Some(bytes) = self.db.get_cf(&cf, public_id.as_bytes())? else {
            return Ok(None);
        };
        let row: ListRow = decode(&bytes)?;
        let items = if with_items {
            self.load_items(row.id)?
        } else {
            Vec::new()
        };
        Ok(Some(List {
            id: row.id,
            public_id: row.public_id,
            name: row.name,
            created_at: row.created_at,
            deleted_at: row.deleted_at,
            items,
        }))
    }

    async fn save_item(&self, list_id: ListId, item: ItemWrite) -> Result<Item, StorageError> {
        let mut saved = self
            .commit(
                list_id,
                ChangeSet {
                    deletes: Vec::new(),
                    saves: vec![item],
                },
            )
            .await?;
        saved
            .pop()
            .ok_or_else(|| StorageError::Database("save produced no row".into()))
    }

    async fn delete_items(&self, ids: &[ItemId]) -> Result<(), StorageError> {
        let _seq = self.sequences.lock().await;
        let mut batch = WriteBatch::default();
        for id in ids {
            self.stage_delete(&mut batch, *id)?;
        }
        self.write(batch)
    }

    async fn commit(&self, list_id: ListId, changes: ChangeSet) -> Result<Vec<Item>, StorageError> {
        let mut seq = self.sequences.lock().await;
        let mut staged = Sequences {
            next_list_id: seq.next_list_id,
            next_item_id: seq.next_item_id,
        };

        let mut batch = WriteBatch::default();
        for id in &changes.deletes {
            self.stage_delete(&mut batch, *id)?;
        }
        let mut saved = Vec::with_capacity(changes.saves.len());
        for write in changes.saves {
            saved.push(self.stage_save(&mut batch, &mut staged, list_id, write, &changes.deletes)?);
        }
        self.stage_sequences(&mut batch, &staged)?;
        self.write(batch)?;

        *seq = staged;
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::normalize_cost;
    use serde_json::json;
    use tempfile::tempdir;

    fn draft(name: &str, after_id: Option<ItemId>) -> ItemWrite {
        ItemWrite {
            id: None,
            name: name.to_string(),
            cost: None,
            done: false,
            parent_id: None,
            after_id,
        }
    }

    #[tokio::test]
    async fn test_list_roundtrip() {
        let dir = tempdir().unwrap();
        let store = RocksStorage::open(RocksConfig::for_testing(dir.path())).unwrap();

        let list = store.create_list().await.unwrap();
        let found = store.find_list(&list.public_id, true).await.unwrap().unwrap();
        assert_eq!(found, list);
        assert!(store.find_list(&Uuid::new_v4(), false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_items_keep_cost_precision_and_absence() {
        let dir = tempdir().unwrap();
        let store = RocksStorage::open(RocksConfig::for_testing(dir.path())).unwrap();
        let list = store.create_list().await.unwrap();

        let mut priced = draft("bread", None);
        priced.cost = normalize_cost(&json!("12"));
        let priced = store.save_item(list.id, priced).await.unwrap();
        let mut free = draft("water", Some(priced.id));
        free.cost = normalize_cost(&json!("0"));
        store.save_item(list.id, free).await.unwrap();
        store.save_item(list.id, draft("air", None)).await.unwrap();

        let found = store.find_list(&list.public_id, true).await.unwrap().unwrap();
        let costs: Vec<Option<String>> = found
            .items
            .iter()
            .map(|i| i.cost.map(|c| c.to_string()))
            .collect();
        assert_eq!(
            costs,
            vec![Some("12.00".to_string()), Some("0.00".to_string()), None]
        );
    }

    #[tokio::test]
    async fn test_items_do_not_leak_between_lists() {
        let dir = tempdir().unwrap();
        let store = RocksStorage::open(RocksConfig::for_testing(dir.path())).unwrap();
        let a = store.create_list().await.unwrap();
        let b = store.create_list().await.unwrap();

        let a1 = store.save_item(a.id, draft("a1", None)).await.unwrap();
        store.save_item(b.id, draft("b1", None)).await.unwrap();

        let found = store.find_list(&a.public_id, true).await.unwrap().unwrap();
        assert_eq!(found.items.len(), 1);
        assert_eq!(found.items[0].id, a1.id);

        let foreign = store.save_item(b.id, ItemWrite::from(&a1)).await;
        assert!(matches!(foreign, Err(StorageError::MissingItem(_, _))));
    }

    #[tokio::test]
    async fn test_commit_deletes_and_relinks_together() {
        let dir = tempdir().unwrap();
        let store = RocksStorage::open(RocksConfig::for_testing(dir.path())).unwrap();
        let list = store.create_list().await.unwrap();
        let one = store.save_item(list.id, draft("1", None)).await.unwrap();
        let two = store.save_item(list.id, draft("2", Some(one.id))).await.unwrap();

        let mut relinked = ItemWrite::from(&two);
        relinked.after_id = None;
        let saved = store
            .commit(
                list.id,
                ChangeSet {
                    deletes: vec![one.id],
                    saves: vec![relinked],
                },
            )
            .await
            .unwrap();
        assert_eq!(saved[0].created_at, two.created_at);

        let found = store.find_list(&list.public_id, true).await.unwrap().unwrap();
        assert_eq!(found.items.len(), 1);
        assert_eq!(found.items[0].id, two.id);
        assert_eq!(found.items[0].after_id, None);
    }

    #[tokio::test]
    async fn test_failed_commit_writes_nothing() {
        let dir = tempdir().unwrap();
        let store = RocksStorage::open(RocksConfig::for_testing(dir.path())).unwrap();
        let list = store.create_list().await.unwrap();
        let one = store.save_item(list.id, draft("1", None)).await.unwrap();

        let result = store
            .commit(
                list.id,
                ChangeSet {
                    deletes: vec![one.id],
                    saves: vec![ItemWrite::from(&one)],
                },
            )
            .await;
        assert!(result.is_err());

        let found = store.find_list(&list.public_id, true).await.unwrap().unwrap();
        assert_eq!(found.items.len(), 1);
    }

    #[tokio::test]
    async fn test_data_and_sequences_survive_reopen() {
        let dir = tempdir().unwrap();
        let (public_id, first_id) = {
            let store = RocksStorage::open(RocksConfig::for_testing(dir.path())).unwrap();
            let list = store.create_list().await.unwrap();
            let item = store.save_item(list.id, draft("keep", None)).await.unwrap();
            store.flush().unwrap();
            (list.public_id, item.id)
        };

        let store = RocksStorage::open(RocksConfig::for_testing(dir.path())).unwrap();
        let found = store.find_list(&public_id, true).await.unwrap().unwrap();
        assert_eq!(found.items.len(), 1);
        assert_eq!(found.items[0].name, "keep");

        let next = store.save_item(found.id, draft("new", Some(first_id))).await.unwrap();
        assert!(next.id > first_id);
        let other = store.create_list().await.unwrap();
        assert_ne!(other.id, found.id);
    }

    #[tokio::test]
    async fn test_delete_items_ignores_unknown_ids() {
        let dir = tempdir().unwrap();
        let store = RocksStorage::open(RocksConfig::for_testing(dir.path())).unwrap();
        let list = store.create_list().await.unwrap();
        let item = store.save_item(list.id, draft("x", None)).await.unwrap();

        store.delete_items(&[item.id, 9999]).await.unwrap();
        let found = store.find_list(&list.public_id, true).await.unwrap().unwrap();
        assert!(found.items.is_empty());
    }
}
