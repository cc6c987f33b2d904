//! Multi-level search and sequential iteration.
//!
//! `search_slot` is the one descent everything else is built on: it walks
//! from the root to the leaf (or a requested floor level), validating each
//! block against its parent, copying blocks on the way down when a
//! transaction is supplied, and proactively splitting or rebalancing so the
//! final leaf operation cannot fail for space.

use crate::balance::{balance_level, split_leaf, split_node};
use crate::cow::{cow_block, CowParent};
use crate::node::leaf_free_space;
use crate::{current_key, pe, Path, TreeRoot, TreeSession, Txn};
use cfs_error::{CorruptionKind, Result, TreeError};
use cfs_ondisk::layout;
use cfs_types::{
    u32_to_usize, Bytenr, Generation, Key, EXTENT_ITEM_KEY, ITEM_SIZE, MAX_LEVEL,
    METADATA_ITEM_KEY,
};
use tracing::trace;

/// Result of a completed search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    /// Exact match; the path points at the item.
    Found,
    /// No match; the path points at the insertion point.
    NotFound,
}

/// Binary search within one block: lowest slot whose key is `>= key`,
/// with an exact-match flag. Returns `(nritems, false)` when every key is
/// smaller.
pub fn bin_search(data: &[u8], key: &Key) -> Result<(usize, bool)> {
    let nritems = u32_to_usize(layout::header_nritems(data).map_err(pe)?, "nritems")
        .map_err(pe)?;
    let mut lo = 0_usize;
    let mut hi = nritems;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let probe = layout::key_at(data, mid).map_err(pe)?;
        if probe < *key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    if lo < nritems {
        let at = layout::key_at(data, lo).map_err(pe)?;
        Ok((lo, at == *key))
    } else {
        Ok((lo, false))
    }
}

/// Validate one block against the structural invariants, relative to the
/// parent pointer used to reach it.
pub fn check_block(
    sess: &TreeSession,
    data: &[u8],
    bytenr: Bytenr,
    expected_level: Option<u8>,
    parent_key: Option<&Key>,
    is_root: bool,
) -> Result<()> {
    let corrupt = |kind: CorruptionKind, detail: String| TreeError::Corrupt {
        bytenr: bytenr.0,
        kind,
        detail,
    };

    let level = layout::header_level(data).map_err(pe)?;
    if usize::from(level) >= MAX_LEVEL {
        return Err(corrupt(
            CorruptionKind::InvalidLevel,
            format!("level {level} exceeds the maximum tree height"),
        ));
    }
    if let Some(expected) = expected_level {
        if level != expected {
            return Err(corrupt(
                CorruptionKind::InvalidLevel,
                format!("expected level {expected}, found {level}"),
            ));
        }
    }

    let nritems = u32_to_usize(layout::header_nritems(data).map_err(pe)?, "nritems")
        .map_err(pe)?;
    let capacity = if level == 0 {
        sess.leaf_capacity()
    } else {
        sess.node_capacity()
    };
    if nritems > capacity {
        return Err(corrupt(
            CorruptionKind::InvalidNritems,
            format!("{nritems} items exceed capacity {capacity}"),
        ));
    }
    if nritems == 0 {
        if is_root {
            return Ok(());
        }
        return Err(corrupt(
            CorruptionKind::InvalidNritems,
            "empty non-root block".to_owned(),
        ));
    }

    let first = layout::key_at(data, 0).map_err(pe)?;
    if let Some(expected) = parent_key {
        if first != *expected {
            return Err(corrupt(
                CorruptionKind::InvalidParentKey,
                format!("first key {first} does not match parent key {expected}"),
            ));
        }
    }

    let mut prev = first;
    for slot in 1..nritems {
        let key = layout::key_at(data, slot).map_err(pe)?;
        if key <= prev {
            return Err(corrupt(
                CorruptionKind::BadKeyOrder,
                format!("slot {slot} key {key} not above {prev}"),
            ));
        }
        prev = key;
    }

    if level == 0 {
        let body = sess.body_size();
        let mut boundary = body;
        for slot in 0..nritems {
            let offset =
                u32_to_usize(layout::item_offset(data, slot).map_err(pe)?, "item_offset")
                    .map_err(pe)?;
            let size = u32_to_usize(layout::item_size(data, slot).map_err(pe)?, "item_size")
                .map_err(pe)?;
            if offset.checked_add(size) != Some(boundary) {
                return Err(corrupt(
                    CorruptionKind::InvalidOffsets,
                    format!("slot {slot} payload [{offset}, {offset}+{size}) does not abut {boundary}"),
                ));
            }
            boundary = offset;
        }
        if nritems * ITEM_SIZE > boundary {
            return Err(corrupt(
                CorruptionKind::InvalidFreeSpace,
                format!("{nritems} descriptors overrun payload at {boundary}"),
            ));
        }
    }
    Ok(())
}

fn reada_sibling(sess: &TreeSession, parent: &[u8], slot: usize, nritems: usize) {
    if slot + 1 < nritems {
        if let (Ok(ptr), Ok(gen)) = (
            layout::node_blockptr(parent, slot + 1),
            layout::node_ptr_generation(parent, slot + 1),
        ) {
            // Best effort; a failed readahead surfaces on the real read.
            let _ = sess.read_tree_block(Bytenr(ptr), Some(Generation(gen)));
        }
    }
}

/// Walk from the root toward `key`, leaving the path positioned at the leaf
/// (or `path.lowest_level`).
///
/// `ins_len` declares intent: positive for an insertion of that total
/// footprint, negative for a deletion, zero for read-only. When `txn` is
/// supplied every visited block is made writable via copy-on-write; blocks
/// near capacity are split on the way down for inserts and underfull levels
/// are rebalanced for deletes.
#[allow(clippy::too_many_lines)]
pub fn search_slot(
    sess: &TreeSession,
    mut txn: Option<&mut Txn<'_>>,
    root: &mut TreeRoot,
    key: &Key,
    path: &mut Path,
    ins_len: i32,
) -> Result<SearchOutcome> {
    if ins_len != 0 && txn.is_none() {
        return Err(TreeError::InvalidArgument(
            "mutating search requires a transaction".to_owned(),
        ));
    }

    'restart: loop {
        path.release();

        let mut block = sess.read_tree_block(root.bytenr, None)?;
        if let Some(t) = txn.as_deref_mut() {
            block = cow_block(sess, t, root, &block, CowParent::Root)?;
        }
        let root_level = {
            let data = block.read();
            layout::header_level(&data).map_err(pe)?
        };
        if root_level != root.level {
            return Err(TreeError::Corrupt {
                bytenr: block.bytenr().0,
                kind: CorruptionKind::InvalidLevel,
                detail: format!(
                    "root records level {}, header says {root_level}",
                    root.level
                ),
            });
        }

        let mut level = root_level;
        let mut parent_key: Option<Key> = None;

        loop {
            let lvl = usize::from(level);
            let is_root = lvl == usize::from(root.level) && parent_key.is_none();

            let (mut slot, exact, nritems) = {
                let data = block.read();
                if !path.skip_check {
                    check_block(
                        sess,
                        &data,
                        block.bytenr(),
                        Some(level),
                        parent_key.as_ref(),
                        is_root,
                    )?;
                }
                let (slot, exact) = bin_search(&data, key)?;
                let nritems =
                    u32_to_usize(layout::header_nritems(&data).map_err(pe)?, "nritems")
                        .map_err(pe)?;
                (slot, exact, nritems)
            };

            if level == 0 || level == path.lowest_level {
                if level > 0 && !exact && slot > 0 {
                    slot -= 1;
                }
                path.nodes[lvl] = Some(block.clone());
                path.slots[lvl] = slot;

                if level == 0 && ins_len > 0 && !path.search_for_split {
                    let need = usize::try_from(ins_len).map_err(|_| {
                        TreeError::InvalidArgument("insertion length overflow".to_owned())
                    })?;
                    let free = {
                        let data = block.read();
                        leaf_free_space(&data, sess.body_size()).map_err(pe)?
                    };
                    if free < need {
                        let t = txn.as_deref_mut().ok_or_else(|| {
                            TreeError::InvalidArgument("split without transaction".to_owned())
                        })?;
                        // An exact match means the caller is growing an
                        // existing item; the split must keep it reachable.
                        split_leaf(sess, t, root, path, key, need, exact)?;
                        let leaf = path.leaf()?.clone();
                        let data = leaf.read();
                        let (slot, exact) = bin_search(&data, key)?;
                        drop(data);
                        path.slots[0] = slot;
                        return Ok(if exact {
                            SearchOutcome::Found
                        } else {
                            SearchOutcome::NotFound
                        });
                    }
                }
                return Ok(if exact {
                    SearchOutcome::Found
                } else {
                    SearchOutcome::NotFound
                });
            }

            // Internal level: descend via the greatest key <= target.
            if !exact && slot > 0 {
                slot -= 1;
            }
            path.nodes[lvl] = Some(block.clone());
            path.slots[lvl] = slot;

            if ins_len > 0 && nritems >= sess.node_capacity().saturating_sub(3) {
                let t = txn.as_deref_mut().ok_or_else(|| {
                    TreeError::InvalidArgument("split without transaction".to_owned())
                })?;
                split_node(sess, t, root, path, lvl)?;
                block = path.node_at(lvl)?.clone();
                slot = path.slots[lvl];
            } else if ins_len < 0 {
                let t = txn.as_deref_mut().ok_or_else(|| {
                    TreeError::InvalidArgument("balance without transaction".to_owned())
                })?;
                balance_level(sess, t, root, path, lvl)?;
                if path.nodes[lvl].is_none() {
                    // The level disappeared (root collapse); start over.
                    continue 'restart;
                }
                block = path.node_at(lvl)?.clone();
                let data = block.read();
                let (s, e) = bin_search(&data, key)?;
                drop(data);
                slot = if !e && s > 0 { s - 1 } else { s };
                path.slots[lvl] = slot;
            }

            let (child_bytenr, child_gen, slot_key, nritems) = {
                let data = block.read();
                (
                    layout::node_blockptr(&data, slot).map_err(pe)?,
                    layout::node_ptr_generation(&data, slot).map_err(pe)?,
                    layout::node_key(&data, slot).map_err(pe)?,
                    u32_to_usize(layout::header_nritems(&data).map_err(pe)?, "nritems")
                        .map_err(pe)?,
                )
            };
            if matches!(path.reada, crate::path::ReadaDirection::Forward) {
                let data = block.read();
                reada_sibling(sess, &data, slot, nritems);
            }

            let mut child = sess.read_tree_block(Bytenr(child_bytenr), Some(Generation(child_gen)))?;
            if let Some(t) = txn.as_deref_mut() {
                child = cow_block(sess, t, root, &child, CowParent::Node(&block, slot))?;
            }
            parent_key = Some(slot_key);
            block = child;
            level -= 1;
            trace!(level, bytenr = block.bytenr().0, "search_descend");
        }
    }
}

/// Like [`search_slot`] but resolves "no exact match" to the closest
/// existing item: the next higher when `prefer_higher`, else the next lower,
/// optionally falling back to the opposite direction at the tree's edge.
///
/// Returns whether the path ended positioned at an item.
pub fn search_nearby(
    sess: &TreeSession,
    root: &mut TreeRoot,
    key: &Key,
    path: &mut Path,
    prefer_higher: bool,
    allow_fallback: bool,
) -> Result<bool> {
    if let SearchOutcome::Found = search_slot(sess, None, root, key, path, 0)? {
        return Ok(true);
    }
    if prefer_higher {
        if position_at_higher(sess, path)? {
            return Ok(true);
        }
        if allow_fallback {
            return position_at_lower(sess, path);
        }
    } else {
        if position_at_lower(sess, path)? {
            return Ok(true);
        }
        if allow_fallback {
            return position_at_higher(sess, path);
        }
    }
    Ok(false)
}

fn leaf_nritems(path: &Path) -> Result<usize> {
    let leaf = path.leaf()?;
    let data = leaf.read();
    u32_to_usize(layout::header_nritems(&data).map_err(pe)?, "nritems").map_err(pe)
}

/// From an insertion-point position, settle on the next existing item.
fn position_at_higher(sess: &TreeSession, path: &mut Path) -> Result<bool> {
    let nritems = leaf_nritems(path)?;
    if path.slots[0] < nritems && nritems > 0 {
        return Ok(true);
    }
    next_leaf(sess, path)
}

/// From an insertion-point position, settle on the previous existing item.
fn position_at_lower(sess: &TreeSession, path: &mut Path) -> Result<bool> {
    if path.slots[0] > 0 {
        path.slots[0] -= 1;
        return Ok(true);
    }
    prev_leaf(sess, path)
}

/// Step to the first slot of the next block at `min_level`, walking up to
/// the nearest ancestor with an unvisited right sibling and re-descending
/// through slot 0.
pub fn next_sibling_at_level(
    sess: &TreeSession,
    path: &mut Path,
    min_level: usize,
) -> Result<bool> {
    for level in (min_level + 1)..MAX_LEVEL {
        let Some(node) = path.nodes[level].as_ref() else {
            return Ok(false);
        };
        let nritems = {
            let data = node.read();
            u32_to_usize(layout::header_nritems(&data).map_err(pe)?, "nritems").map_err(pe)?
        };
        if path.slots[level] + 1 < nritems {
            path.slots[level] += 1;
            descend_edge(sess, path, level, min_level, true)?;
            return Ok(true);
        }
    }
    Ok(false)
}

/// Step to the last slot of the previous block at `min_level`.
pub fn prev_sibling_at_level(
    sess: &TreeSession,
    path: &mut Path,
    min_level: usize,
) -> Result<bool> {
    for level in (min_level + 1)..MAX_LEVEL {
        if path.nodes[level].is_none() {
            return Ok(false);
        }
        if path.slots[level] > 0 {
            path.slots[level] -= 1;
            descend_edge(sess, path, level, min_level, false)?;
            return Ok(true);
        }
    }
    Ok(false)
}

/// Advance the path to the first item of the next leaf.
pub fn next_leaf(sess: &TreeSession, path: &mut Path) -> Result<bool> {
    next_sibling_at_level(sess, path, 0)
}

/// Move the path to the last item of the previous leaf.
pub fn prev_leaf(sess: &TreeSession, path: &mut Path) -> Result<bool> {
    prev_sibling_at_level(sess, path, 0)
}

/// Re-descend from `path.nodes[from_level]` down to `to_level` along the
/// leftmost (`forward`) or rightmost edge.
fn descend_edge(
    sess: &TreeSession,
    path: &mut Path,
    from_level: usize,
    to_level: usize,
    forward: bool,
) -> Result<()> {
    let mut level = from_level;
    while level > to_level {
        let (child_bytenr, child_gen, slot_key, expected_level) = {
            let node = path.node_at(level)?;
            let data = node.read();
            let slot = path.slots[level];
            (
                layout::node_blockptr(&data, slot).map_err(pe)?,
                layout::node_ptr_generation(&data, slot).map_err(pe)?,
                layout::node_key(&data, slot).map_err(pe)?,
                u8::try_from(level - 1)
                    .map_err(|_| TreeError::InvalidArgument("level overflow".to_owned()))?,
            )
        };
        let child = sess.read_tree_block(Bytenr(child_bytenr), Some(Generation(child_gen)))?;
        let slot = {
            let data = child.read();
            if !path.skip_check {
                check_block(
                    sess,
                    &data,
                    child.bytenr(),
                    Some(expected_level),
                    Some(&slot_key),
                    false,
                )?;
            }
            let nritems =
                u32_to_usize(layout::header_nritems(&data).map_err(pe)?, "nritems").map_err(pe)?;
            if forward {
                0
            } else {
                nritems.saturating_sub(1)
            }
        };
        level -= 1;
        path.nodes[level] = Some(child);
        path.slots[level] = slot;
    }
    Ok(())
}

/// Walk backward from the current position to the closest item matching
/// `(objectid, item_type)`. Stops (returning false) once keys drop below
/// `objectid`.
pub fn previous_item_of_type(
    sess: &TreeSession,
    path: &mut Path,
    objectid: u64,
    item_type: u8,
) -> Result<bool> {
    loop {
        if path.slots[0] == 0 {
            if !prev_leaf(sess, path)? {
                return Ok(false);
            }
        } else {
            path.slots[0] -= 1;
        }
        let key = current_key(path)?;
        if key.objectid == objectid && key.item_type == item_type {
            return Ok(true);
        }
        if key.objectid < objectid {
            return Ok(false);
        }
    }
}

fn is_extent_item(key: &Key) -> bool {
    key.item_type == EXTENT_ITEM_KEY || key.item_type == METADATA_ITEM_KEY
}

/// Advance to the next extent or metadata item, skipping everything else.
pub fn next_extent_item(sess: &TreeSession, path: &mut Path) -> Result<bool> {
    loop {
        let nritems = leaf_nritems(path)?;
        if path.slots[0] + 1 < nritems {
            path.slots[0] += 1;
        } else if !next_leaf(sess, path)? {
            return Ok(false);
        }
        if is_extent_item(&current_key(path)?) {
            return Ok(true);
        }
    }
}

/// Walk backward to the closest extent or metadata item at or above
/// `min_objectid`.
pub fn previous_extent_item(
    sess: &TreeSession,
    path: &mut Path,
    min_objectid: u64,
) -> Result<bool> {
    loop {
        if path.slots[0] == 0 {
            if !prev_leaf(sess, path)? {
                return Ok(false);
            }
        } else {
            path.slots[0] -= 1;
        }
        let key = current_key(path)?;
        if key.objectid < min_objectid {
            return Ok(false);
        }
        if is_extent_item(&key) {
            return Ok(true);
        }
    }
}
