//! Sibling-chain ordering over flat item rows.
//!
//! Every group of items sharing a `parent_id` is a singly linked list
//! threaded through `after_id`:
//!
//! ```text
//! parent = None:   [1: after None] ◄── [2: after 1] ◄── [5: after 2]
//!                        │
//! parent = 1:            └── [3: after None] ◄── [4: after 3]
//! ```
//!
//! [`build_tree`] walks each chain from its head and nests groups under
//! their parents. Anything it cannot reach from a head is reported as
//! [`StructuralCorruption`] instead of being dropped.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use crate::model::{Item, ItemId, NestedItem};

/// A single defect found while reconstructing the forest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Defect {
    /// A non-empty sibling group without an item whose `after_id` is null.
    NoHead { parent_id: Option<ItemId>, ids: Vec<ItemId> },
    /// A sibling group with more than one head.
    MultipleHeads { parent_id: Option<ItemId>, heads: Vec<ItemId> },
    /// Several items claim the same predecessor.
    Branch { after_id: ItemId, ids: Vec<ItemId> },
    /// Items not reachable from any head: broken links, cycles, orphans.
    Unreachable { ids: Vec<ItemId> },
}

impl Defect {
    fn ids(&self) -> &[ItemId] {
        match self {
            Defect::NoHead { ids, .. } => ids,
            Defect::MultipleHeads { heads, .. } => heads,
            Defect::Branch { ids, .. } => ids,
            Defect::Unreachable { ids } => ids,
        }
    }
}

/// The item rows of a list violate the sibling-chain invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuralCorruption {
    pub defects: Vec<Defect>,
}

impl StructuralCorruption {
    /// Every id involved in any defect, sorted and deduplicated.
    pub fn offending_ids(&self) -> Vec<ItemId> {
        self.defects
            .iter()
            .flat_map(|d| d.ids().iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

impl fmt::Display for StructuralCorruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Structural corruption in list ordering, offending items: {:?}",
            self.offending_ids()
        )
    }
}

impl std::error::Error for StructuralCorruption {}

/// Rebuild the ordered forest from flat rows.
///
/// Deterministic for identical input regardless of row order. Fails with
/// every defect found when any group is malformed.
pub fn build_tree(items: &[Item]) -> Result<Vec<NestedItem>, StructuralCorruption> {
    let mut groups: HashMap<Option<ItemId>, Vec<&Item>> = HashMap::new();
    for item in items {
        groups.entry(item.parent_id).or_default().push(item);
    }

    let mut defects = Vec::new();
    let mut ordered: HashMap<Option<ItemId>, Vec<&Item>> = HashMap::new();
    let mut visited: HashSet<ItemId> = HashSet::with_capacity(items.len());

    // A group is only reached through its single parent, so each one is
    // walked at most once and parent cycles never get entered.
    let mut pending = vec![None];
    while let Some(parent_id) = pending.pop() {
        let Some(group) = groups.get(&parent_id) else {
            continue;
        };
        let chain = walk_chain(parent_id, group, &mut defects);
        for item in &chain {
            if visited.insert(item.id) {
                pending.push(Some(item.id));
            }
        }
        ordered.insert(parent_id, chain);
    }

    let unreachable: Vec<ItemId> = items
        .iter()
        .map(|i| i.id)
        .filter(|id| !visited.contains(id))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if !unreachable.is_empty() {
        defects.push(Defect::Unreachable { ids: unreachable });
    }

    if !defects.is_empty() {
        return Err(StructuralCorruption { defects });
    }

    Ok(nest(None, &ordered))
}

/// Follow one sibling group from its head. Records head and branch defects;
/// items left off the returned chain are picked up as unreachable later.
fn walk_chain<'a>(
    parent_id: Option<ItemId>,
    group: &[&'a Item],
    defects: &mut Vec<Defect>,
) -> Vec<&'a Item> {
    let mut successors: BTreeMap<ItemId, Vec<&'a Item>> = BTreeMap::new();
    let mut heads: Vec<&'a Item> = Vec::new();
    for &item in group {
        match item.after_id {
            None => heads.push(item),
            Some(after) => successors.entry(after).or_default().push(item),
        }
    }

    match heads.len() {
        0 => {
            let mut ids: Vec<ItemId> = group.iter().map(|i| i.id).collect();
            ids.sort_unstable();
            defects.push(Defect::NoHead { parent_id, ids });
            return Vec::new();
        }
        1 => {}
        _ => {
            let mut ids: Vec<ItemId> = heads.iter().map(|i| i.id).collect();
            ids.sort_unstable();
            defects.push(Defect::MultipleHeads { parent_id, heads: ids });
            return Vec::new();
        }
    }

    let mut chain = Vec::with_capacity(group.len());
    let mut seen = HashSet::with_capacity(group.len());
    let mut current = heads[0];
    loop {
        if !seen.insert(current.id) {
            break;
        }
        chain.push(current);
        match successors.get(&current.id).map(Vec::as_slice) {
            None | Some([]) => break,
            Some([next]) => current = *next,
            Some(many) => {
                let mut ids: Vec<ItemId> = many.iter().map(|i| i.id).collect();
                ids.sort_unstable();
                defects.push(Defect::Branch { after_id: current.id, ids });
                break;
            }
        }
    }
    chain
}

fn nest(
    parent_id: Option<ItemId>,
    ordered: &HashMap<Option<ItemId>, Vec<&Item>>,
) -> Vec<NestedItem> {
    ordered
        .get(&parent_id)
        .map(|chain| {
            chain
                .iter()
                .map(|item| {
                    let mut node = NestedItem::leaf(item);
                    node.items = nest(Some(item.id), ordered);
                    node
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Ids removed by deleting `target_id`: the target plus all its
/// descendants through `parent_id`. Order is not significant.
pub fn cascade_delete(items: &[Item], target_id: ItemId) -> Vec<ItemId> {
    let mut children: HashMap<ItemId, Vec<ItemId>> = HashMap::new();
    for item in items {
        if let Some(parent) = item.parent_id {
            children.entry(parent).or_default().push(item.id);
        }
    }

    let mut removed = vec![target_id];
    let mut seen: HashSet<ItemId> = HashSet::from([target_id]);
    let mut cursor = 0;
    while cursor < removed.len() {
        if let Some(kids) = children.get(&removed[cursor]) {
            for &kid in kids {
                if seen.insert(kid) {
                    removed.push(kid);
                }
            }
        }
        cursor += 1;
    }
    removed
}

/// The successor of `removed`, relinked to take its place in the chain.
///
/// Returns the updated successor (which must be persisted and broadcast),
/// or `None` when `removed` was the tail of its group.
pub fn relink_after_delete(items: &[Item], removed: &Item) -> Option<Item> {
    items
        .iter()
        .find(|i| {
            i.id != removed.id
                && i.after_id == Some(removed.id)
                && i.parent_id == removed.parent_id
        })
        .map(|next| Item {
            after_id: removed.after_id,
            ..next.clone()
        })
}
