//! Domain records for shared lists and their items.
//!
//! Storage hands out flat [`Item`] rows; the ordered, nested view a viewer
//! sees is a [`NestedList`] built by [`crate::ordering::build_tree`].

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::SystemTime;
use uuid::Uuid;

/// Internal list key assigned by storage.
pub type ListId = u64;

/// Numeric item key assigned by storage.
pub type ItemId = i64;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A shared list.
///
/// `public_id` is the random, unguessable identifier clients use to share
/// and address the list. `items` is only populated when storage was asked
/// to load them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct List {
    pub id: ListId,
    pub public_id: Uuid,
    pub name: String,
    pub created_at: u64,
    /// Logical tombstone. Not enforced by the sync engine.
    pub deleted_at: Option<u64>,
    #[serde(default)]
    pub items: Vec<Item>,
}

impl List {
    /// A fresh, empty list with a random public id.
    pub fn new(id: ListId) -> Self {
        Self {
            id,
            public_id: Uuid::new_v4(),
            name: String::new(),
            created_at: now_millis(),
            deleted_at: None,
            items: Vec::new(),
        }
    }
}

/// One persisted entry of a list.
///
/// `after_id` links the item behind its predecessor among the items sharing
/// the same `parent_id`; `None` marks the head of that sibling group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: ItemId,
    pub name: String,
    /// Absent and zero are distinct values.
    pub cost: Option<Decimal>,
    pub done: bool,
    pub parent_id: Option<ItemId>,
    pub after_id: Option<ItemId>,
    pub list_id: ListId,
    pub created_at: u64,
}

/// Client-supplied item fields for a create (`id == None`) or update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ItemDraft {
    pub id: Option<ItemId>,
    pub name: String,
    /// Raw cost input: a string, a number, or nothing.
    pub cost: serde_json::Value,
    pub done: bool,
    pub parent_id: Option<ItemId>,
    pub after_id: Option<ItemId>,
}

/// Normalized item ready to be written by storage.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemWrite {
    pub id: Option<ItemId>,
    pub name: String,
    pub cost: Option<Decimal>,
    pub done: bool,
    pub parent_id: Option<ItemId>,
    pub after_id: Option<ItemId>,
}

impl ItemDraft {
    /// Normalize the draft into a storage write.
    pub fn normalize(self) -> ItemWrite {
        ItemWrite {
            id: self.id,
            name: self.name,
            cost: normalize_cost(&self.cost),
            done: self.done,
            parent_id: self.parent_id,
            after_id: self.after_id,
        }
    }
}

impl From<&Item> for ItemWrite {
    fn from(item: &Item) -> Self {
        Self {
            id: Some(item.id),
            name: item.name.clone(),
            cost: item.cost,
            done: item.done,
            parent_id: item.parent_id,
            after_id: item.after_id,
        }
    }
}

/// Normalize a raw monetary input to a fixed two-decimal value.
///
/// Empty, missing or non-numeric input becomes `None`, never zero.
pub fn normalize_cost(raw: &serde_json::Value) -> Option<Decimal> {
    let text = match raw {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        return None;
    }
    let mut value = Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()?;
    value.rescale(2);
    Some(value)
}

/// An item with its ordered children, as sent to viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NestedItem {
    pub id: ItemId,
    pub name: String,
    pub cost: Option<Decimal>,
    pub done: bool,
    pub parent_id: Option<ItemId>,
    pub after_id: Option<ItemId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<NestedItem>,
}

impl NestedItem {
    pub(crate) fn leaf(item: &Item) -> Self {
        Self {
            id: item.id,
            name: item.name.clone(),
            cost: item.cost,
            done: item.done,
            parent_id: item.parent_id,
            after_id: item.after_id,
            items: Vec::new(),
        }
    }
}

/// The ordered forest of a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedList {
    pub uuid: Uuid,
    pub name: String,
    pub items: Vec<NestedItem>,
}

/// Saved item as broadcast to subscribers, with the client's sibling index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemBroadcast {
    #[serde(flatten)]
    pub item: Item,
    pub index: i64,
}
