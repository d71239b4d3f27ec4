//! List orchestration: the mutation state machine.
//!
//! ```text
//! RECEIVED ─► VALIDATED ─► PERSISTED ─► CACHE_INVALIDATED ─► BROADCAST ─► ACKNOWLEDGED
//!    │            │
//!    └────────────┴──► error to the origin only, nothing written
//! ```
//!
//! Once an operation is `PERSISTED` the origin is always acknowledged.
//! Cache and fan-out failures past that point are reported, never rolled
//! back.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::cache::{fingerprint, list_key, tree_key, CacheService};
use crate::connection::ConnectionId;
use crate::error::SyncError;
use crate::model::{Item, ItemBroadcast, ItemDraft, ItemId, ItemWrite, NestedList};
use crate::ordering::{build_tree, cascade_delete, relink_after_delete};
use crate::protocol::{
    CreateListResponse, ItemAck, OutboundFrame, TYPE_DELETE_ITEM, TYPE_SAVE_ITEM,
};
use crate::report::SharedReporter;
use crate::storage::{ChangeSet, Storage};
use crate::subscription::SubscriptionTracker;

/// Index broadcast when the client did not supply one.
pub const NO_INDEX: i64 = -1;

/// Progress of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Received,
    Validated,
    Persisted,
    CacheInvalidated,
    Broadcast,
    Acknowledged,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "RECEIVED",
            Stage::Validated => "VALIDATED",
            Stage::Persisted => "PERSISTED",
            Stage::CacheInvalidated => "CACHE_INVALIDATED",
            Stage::Broadcast => "BROADCAST",
            Stage::Acknowledged => "ACKNOWLEDGED",
        };
        f.write_str(name)
    }
}

/// Scoped trace of one operation.
///
/// Logs the furthest stage reached when dropped, so early returns and
/// panics close the span too.
pub struct OpSpan {
    op: &'static str,
    list: Option<Uuid>,
    stage: Stage,
    started: Instant,
    reporter: SharedReporter,
}

impl OpSpan {
    pub fn start(op: &'static str, list: Option<Uuid>, reporter: SharedReporter) -> Self {
        reporter.breadcrumb("span", &format!("{op} started"));
        Self {
            op,
            list,
            stage: Stage::Received,
            started: Instant::now(),
            reporter,
        }
    }

    pub fn advance(&mut self, stage: Stage) {
        self.stage = stage;
        log::trace!("{} {:?} -> {stage}", self.op, self.list);
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn finish(mut self) {
        self.advance(Stage::Acknowledged);
    }
}

impl Drop for OpSpan {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        let list = self.list.map(|l| l.to_string()).unwrap_or_else(|| "-".into());
        if self.stage == Stage::Acknowledged {
            log::debug!("{} on list {list} done in {elapsed:?}", self.op);
        } else {
            log::debug!(
                "{} on list {list} stopped at {} after {elapsed:?}",
                self.op,
                self.stage
            );
        }
        self.reporter.breadcrumb(
            "span",
            &format!("{} finished at {}", self.op, self.stage),
        );
    }
}

/// Owner of list reads and mutations.
pub struct ListService {
    storage: Arc<dyn Storage>,
    cache: Arc<CacheService>,
    tracker: Arc<SubscriptionTracker>,
    reporter: SharedReporter,
}

impl ListService {
    pub fn new(
        storage: Arc<dyn Storage>,
        cache: Arc<CacheService>,
        tracker: Arc<SubscriptionTracker>,
        reporter: SharedReporter,
    ) -> Self {
        Self {
            storage,
            cache,
            tracker,
            reporter,
        }
    }

    pub fn tracker(&self) -> &Arc<SubscriptionTracker> {
        &self.tracker
    }

    pub fn cache(&self) -> &Arc<CacheService> {
        &self.cache
    }

    /// Create an empty list and subscribe its creator to it.
    pub async fn create_list(&self, conn: ConnectionId) -> Result<CreateListResponse, SyncError> {
        let mut span = OpSpan::start("createList", None, self.reporter.clone());
        span.advance(Stage::Validated);

        let list = self.storage.create_list().await?;
        span.advance(Stage::Persisted);
        log::info!("List {} created", list.public_id);

        self.tracker.subscribe(list.public_id, conn).await;
        span.finish();
        Ok(CreateListResponse { id: list.public_id })
    }

    /// Ordered tree of `uuid`, through the cache. Subscribes `conn` to it.
    ///
    /// The subscription is taken before the read so no mutation slips
    /// between the snapshot and the first broadcast. A failed read restores
    /// the previous subscription.
    pub async fn get_list(&self, conn: ConnectionId, uuid: Uuid) -> Result<NestedList, SyncError> {
        let span = OpSpan::start("getList", Some(uuid), self.reporter.clone());

        let previous = self.tracker.subscription_of(&conn).await;
        self.tracker.subscribe(uuid, conn).await;

        let result = self
            .cache
            .get_or_compute(&list_key(&uuid), || self.load_nested(uuid))
            .await;

        if result.is_err() {
            match previous {
                Some(list) => self.tracker.subscribe(list, conn).await,
                None => {
                    self.tracker.unsubscribe(&conn).await;
                }
            }
            return result;
        }
        span.finish();
        result
    }

    async fn load_nested(&self, uuid: Uuid) -> Result<NestedList, SyncError> {
        let list = self
            .storage
            .find_list(&uuid, true)
            .await?
            .ok_or_else(|| SyncError::NotFound("No such list".into()))?;

        let items = match fingerprint(&list.items) {
            Some(fp) => {
                self.cache
                    .get_or_compute(&tree_key(fp), || async {
                        build_tree(&list.items).map_err(SyncError::from)
                    })
                    .await?
            }
            None => build_tree(&list.items)?,
        };

        Ok(NestedList {
            uuid: list.public_id,
            name: list.name,
            items,
        })
    }

    /// Create or update an item and broadcast it to the list's subscribers.
    pub async fn save_item(
        &self,
        uuid: Uuid,
        draft: ItemDraft,
        index: Option<i64>,
    ) -> Result<ItemAck, SyncError> {
        let mut span = OpSpan::start("saveItem", Some(uuid), self.reporter.clone());

        let list = self
            .storage
            .find_list(&uuid, true)
            .await?
            .ok_or_else(|| SyncError::NotFound("No such list".into()))?;
        let write = draft.normalize();
        validate_write(&write, &list.items)?;
        span.advance(Stage::Validated);

        let item = self.storage.save_item(list.id, write).await?;
        span.advance(Stage::Persisted);
        log::debug!("Item {} saved in list {uuid}", item.id);

        self.cache.invalidate(&list_key(&uuid)).await;
        span.advance(Stage::CacheInvalidated);

        let id = item.id;
        self.broadcast(
            &uuid,
            TYPE_SAVE_ITEM,
            &ItemBroadcast {
                item,
                index: index.unwrap_or(NO_INDEX),
            },
        )
        .await;
        span.advance(Stage::Broadcast);

        span.finish();
        Ok(ItemAck::ok(id))
    }

    /// Delete an item with its descendants and relink its successor.
    ///
    /// Subscribers receive the relinked successor (if any) and then the
    /// removed item; descendant removals are implied and not broadcast.
    pub async fn delete_item(&self, uuid: Uuid, item_id: ItemId) -> Result<ItemAck, SyncError> {
        let mut span = OpSpan::start("deleteItem", Some(uuid), self.reporter.clone());

        let list = self
            .storage
            .find_list(&uuid, true)
            .await?
            .ok_or_else(|| SyncError::NotFound("No such list".into()))?;
        let current = list
            .items
            .iter()
            .find(|i| i.id == item_id)
            .cloned()
            .ok_or_else(|| {
                SyncError::NotFound("Item you are trying to remove was not found".into())
            })?;

        let removed = cascade_delete(&list.items, current.id);
        let relinked = relink_after_delete(&list.items, &current)
            .filter(|next| !removed.contains(&next.id));
        span.advance(Stage::Validated);

        let changes = ChangeSet {
            saves: relinked.iter().map(ItemWrite::from).collect(),
            deletes: removed,
        };
        let removed_count = changes.deletes.len();
        let saved = self.storage.commit(list.id, changes).await?;
        span.advance(Stage::Persisted);
        log::debug!("Deleted {removed_count} item(s) from list {uuid}, root {}", current.id);

        self.cache.invalidate(&list_key(&uuid)).await;
        span.advance(Stage::CacheInvalidated);

        for item in saved {
            self.broadcast(&uuid, TYPE_SAVE_ITEM, &ItemBroadcast { item, index: NO_INDEX })
                .await;
        }
        self.broadcast(&uuid, TYPE_DELETE_ITEM, &current).await;
        span.advance(Stage::Broadcast);

        span.finish();
        Ok(ItemAck::ok(current.id))
    }

    /// Forget every subscription of a closed connection.
    pub async fn handle_disconnect(&self, conn: &ConnectionId) {
        self.tracker.unsubscribe(conn).await;
    }

    async fn broadcast<T: Serialize>(&self, uuid: &Uuid, kind: &str, payload: &T) {
        let frame = match serde_json::to_value(payload) {
            Ok(data) => OutboundFrame::broadcast(kind, data),
            Err(e) => {
                log::error!("Failed to encode {kind} broadcast for list {uuid}: {e}");
                self.reporter.capture(&e);
                return;
            }
        };
        if let Err(e) = self.tracker.fanout(uuid, &frame).await {
            log::error!("Fan-out of {kind} on list {uuid} failed: {e}");
            self.reporter.capture(&e);
        }
    }
}

/// Reject writes that reference items outside the list.
fn validate_write(write: &ItemWrite, items: &[Item]) -> Result<(), SyncError> {
    let by_id: HashMap<ItemId, &Item> = items.iter().map(|i| (i.id, i)).collect();

    if let Some(id) = write.id {
        if !by_id.contains_key(&id) {
            return Err(SyncError::NotFound(
                "Item you are trying to save was not found".into(),
            ));
        }
        if write.parent_id == Some(id) {
            return Err(SyncError::InvalidRequest("an item cannot be its own parent".into()));
        }
        if write.after_id == Some(id) {
            return Err(SyncError::InvalidRequest(
                "an item cannot follow itself".into(),
            ));
        }
    }
    if let Some(parent) = write.parent_id {
        if !by_id.contains_key(&parent) {
            return Err(SyncError::NotFound("Parent item was not found".into()));
        }
    }
    if let Some(after) = write.after_id {
        let Some(preceding) = by_id.get(&after) else {
            return Err(SyncError::NotFound("Preceding item was not found".into()));
        };
        // Chains only link siblings.
        if preceding.parent_id != write.parent_id {
            return Err(SyncError::InvalidRequest(
                "preceding item has a different parent".into(),
            ));
        }
    }
    Ok(())
}
