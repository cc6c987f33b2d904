//! Split, push, and rebalance.
//!
//! Insert descents split proactively (nodes near capacity, leaves without
//! room), delete descents merge or steal from siblings, and the root grows
//! or collapses at the edges. A push that cannot help reports
//! [`PushOutcome::NoRoom`] rather than an error; real failures propagate.
//!
//! All functions assume the blocks along the path were already made
//! writable by the copy-on-write descent; siblings are copied here when
//! first touched.

use crate::cow::{cow_block, CowParent};
use crate::node::{
    leaf_free_space, leaf_push_head_to_left, leaf_push_tail_to_right, leaf_space_used,
    node_push_head_to_left, node_push_tail_to_right,
};
use crate::{pe, Path, TreeRoot, TreeSession, Txn};
use cfs_block::BlockHandle;
use cfs_error::{CorruptionKind, Result, TreeError};
use cfs_ondisk::layout;
use cfs_types::{u32_to_usize, Bytenr, Generation, Key, ITEM_SIZE, KEY_PTR_SIZE, MAX_LEVEL};
use tracing::{debug, trace};

/// Result of a sibling push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The push freed enough space; no new block is needed.
    Pushed,
    /// The sibling could not absorb enough; the caller must split.
    NoRoom,
}

/// Donor gate: a leaf with fewer items is not worth raiding.
const PUSH_MIN_ITEMS: usize = 4;
/// A push never leaves the donor below this many items unless it empties
/// it entirely.
const PUSH_DONOR_FLOOR: usize = 8;

fn nritems_of(block: &BlockHandle) -> Result<usize> {
    let data = block.read();
    u32_to_usize(layout::header_nritems(&data).map_err(pe)?, "nritems").map_err(pe)
}

fn free_block(
    sess: &TreeSession,
    txn: &mut Txn<'_>,
    root: &TreeRoot,
    bytenr: Bytenr,
    level: u8,
) -> Result<()> {
    txn.alloc
        .free_tree_block(bytenr, sess.nodesize(), root.id, level)?;
    sess.cache().forget(bytenr);
    trace!(bytenr = bytenr.0, level, "tree_block_free");
    Ok(())
}

/// Rewrite the low-key chain after the first key of the block below
/// `from_level` changed: update the parent slot, and keep walking up while
/// the updated slot is itself slot 0.
pub fn fixup_low_keys(
    sess: &TreeSession,
    path: &Path,
    key: &Key,
    from_level: usize,
) -> Result<()> {
    for level in from_level..MAX_LEVEL {
        let Some(node) = path.nodes[level].as_ref() else {
            break;
        };
        {
            let mut data = node.write();
            layout::set_node_key(&mut data, path.slots[level], key).map_err(pe)?;
        }
        sess.mark_dirty(node.bytenr());
        if path.slots[level] != 0 {
            break;
        }
    }
    Ok(())
}

/// Grow the tree by one level: a new root node with a single pointer at the
/// old root.
pub fn insert_new_root(
    sess: &TreeSession,
    txn: &mut Txn<'_>,
    root: &mut TreeRoot,
    path: &mut Path,
) -> Result<()> {
    let old_level = usize::from(root.level);
    if old_level + 1 >= MAX_LEVEL {
        return Err(TreeError::InvalidArgument(
            "tree height limit reached".to_owned(),
        ));
    }
    let old = path.node_at(old_level)?.clone();
    let (first, old_gen) = {
        let data = old.read();
        (
            layout::first_key(&data).map_err(pe)?,
            layout::header_generation(&data).map_err(pe)?,
        )
    };

    let new = sess.alloc_tree_block(txn, root.id, root.level + 1, root.bytenr)?;
    {
        let mut data = new.write();
        layout::set_node_key(&mut data, 0, &first).map_err(pe)?;
        layout::set_node_blockptr(&mut data, 0, old.bytenr().0).map_err(pe)?;
        layout::set_node_ptr_generation(&mut data, 0, old_gen).map_err(pe)?;
        layout::set_header_nritems(&mut data, 1).map_err(pe)?;
    }
    root.bytenr = new.bytenr();
    root.level += 1;
    root.generation = txn.generation;
    path.nodes[old_level + 1] = Some(new);
    path.slots[old_level + 1] = 0;
    debug!(level = root.level, bytenr = root.bytenr.0, "tree_grow");
    Ok(())
}

/// Insert a key-pointer at `slot` of the node at `level`. The caller
/// guarantees room.
pub fn insert_ptr(
    sess: &TreeSession,
    path: &Path,
    level: usize,
    key: &Key,
    bytenr: Bytenr,
    generation: Generation,
    slot: usize,
) -> Result<()> {
    let node = path.node_at(level)?.clone();
    {
        let mut data = node.write();
        let nritems = u32_to_usize(layout::header_nritems(&data).map_err(pe)?, "nritems")
            .map_err(pe)?;
        if nritems >= sess.node_capacity() {
            return Err(TreeError::NoSpace);
        }
        if slot > nritems {
            return Err(TreeError::InvalidArgument(format!(
                "pointer slot {slot} beyond {nritems} items"
            )));
        }
        data.copy_within(
            cfs_types::HEADER_SIZE + slot * KEY_PTR_SIZE
                ..cfs_types::HEADER_SIZE + nritems * KEY_PTR_SIZE,
            cfs_types::HEADER_SIZE + (slot + 1) * KEY_PTR_SIZE,
        );
        layout::set_node_key(&mut data, slot, key).map_err(pe)?;
        layout::set_node_blockptr(&mut data, slot, bytenr.0).map_err(pe)?;
        layout::set_node_ptr_generation(&mut data, slot, generation.0).map_err(pe)?;
        layout::set_header_nritems(
            &mut data,
            u32::try_from(nritems + 1)
                .map_err(|_| TreeError::InvalidArgument("nritems overflow".to_owned()))?,
        )
        .map_err(pe)?;
    }
    sess.mark_dirty(node.bytenr());
    if slot == 0 {
        fixup_low_keys(sess, path, key, level + 1)?;
    }
    Ok(())
}

/// Remove the key-pointer at `slot` of the node at `level`, cascading
/// upward when the node empties and collapsing the root when it is left
/// with a single child.
pub fn del_ptr(
    sess: &TreeSession,
    txn: &mut Txn<'_>,
    root: &mut TreeRoot,
    path: &mut Path,
    level: usize,
    slot: usize,
) -> Result<()> {
    let node = path.node_at(level)?.clone();
    let remaining = {
        let mut data = node.write();
        let nritems = u32_to_usize(layout::header_nritems(&data).map_err(pe)?, "nritems")
            .map_err(pe)?;
        if slot >= nritems {
            return Err(TreeError::InvalidArgument(format!(
                "pointer slot {slot} beyond {nritems} items"
            )));
        }
        data.copy_within(
            cfs_types::HEADER_SIZE + (slot + 1) * KEY_PTR_SIZE
                ..cfs_types::HEADER_SIZE + nritems * KEY_PTR_SIZE,
            cfs_types::HEADER_SIZE + slot * KEY_PTR_SIZE,
        );
        let remaining = nritems - 1;
        layout::set_header_nritems(
            &mut data,
            u32::try_from(remaining)
                .map_err(|_| TreeError::InvalidArgument("nritems overflow".to_owned()))?,
        )
        .map_err(pe)?;
        remaining
    };
    sess.mark_dirty(node.bytenr());

    let is_root = path.nodes.get(level + 1).is_none_or(|n| n.is_none());
    if remaining == 0 {
        if is_root {
            return Err(TreeError::Corrupt {
                bytenr: node.bytenr().0,
                kind: CorruptionKind::InvalidNritems,
                detail: "root node emptied".to_owned(),
            });
        }
        let parent_slot = path.slots[level + 1];
        path.nodes[level] = None;
        del_ptr(sess, txn, root, path, level + 1, parent_slot)?;
        free_block(
            sess,
            txn,
            root,
            node.bytenr(),
            u8::try_from(level)
                .map_err(|_| TreeError::InvalidArgument("level overflow".to_owned()))?,
        )?;
        return Ok(());
    }

    if slot == 0 {
        let first = {
            let data = node.read();
            layout::node_key(&data, 0).map_err(pe)?
        };
        fixup_low_keys(sess, path, &first, level + 1)?;
    }

    if is_root && remaining == 1 && level > 0 {
        // The root carries a single child: promote it.
        let child = {
            let data = node.read();
            layout::node_blockptr(&data, 0).map_err(pe)?
        };
        root.bytenr = Bytenr(child);
        root.level = u8::try_from(level - 1)
            .map_err(|_| TreeError::InvalidArgument("level underflow".to_owned()))?;
        root.generation = txn.generation;
        path.nodes[level] = None;
        free_block(
            sess,
            txn,
            root,
            node.bytenr(),
            u8::try_from(level)
                .map_err(|_| TreeError::InvalidArgument("level overflow".to_owned()))?,
        )?;
        debug!(level = root.level, bytenr = root.bytenr.0, "root_collapse");
    }
    Ok(())
}

/// Split the node at `level`, growing the tree first when it is the root.
/// The path is updated to the half that contains its old slot.
pub fn split_node(
    sess: &TreeSession,
    txn: &mut Txn<'_>,
    root: &mut TreeRoot,
    path: &mut Path,
    level: usize,
) -> Result<()> {
    if path.nodes.get(level + 1).is_none_or(|n| n.is_none()) {
        insert_new_root(sess, txn, root, path)?;
    } else {
        let parent_n = nritems_of(path.node_at(level + 1)?)?;
        if parent_n >= sess.node_capacity() {
            split_node(sess, txn, root, path, level + 1)?;
        }
    }

    let block = path.node_at(level)?.clone();
    let nritems = nritems_of(&block)?;
    let mid = (nritems + 1) / 2;
    let moved = nritems - mid;
    let new = sess.alloc_tree_block(
        txn,
        root.id,
        u8::try_from(level).map_err(|_| TreeError::InvalidArgument("level overflow".to_owned()))?,
        block.bytenr(),
    )?;
    {
        let mut left = block.write();
        let mut right = new.write();
        node_push_tail_to_right(&mut left, &mut right, moved).map_err(pe)?;
    }
    sess.mark_dirty(block.bytenr());

    let right_first = {
        let data = new.read();
        layout::node_key(&data, 0).map_err(pe)?
    };
    insert_ptr(
        sess,
        path,
        level + 1,
        &right_first,
        new.bytenr(),
        txn.generation,
        path.slots[level + 1] + 1,
    )?;

    if path.slots[level] >= mid {
        path.slots[level] -= mid;
        path.nodes[level] = Some(new);
        path.slots[level + 1] += 1;
    }
    trace!(level, mid, nritems, "node_split");
    Ok(())
}

/// Read and COW the sibling at `parent_slot` of the node at `parent_level`.
fn cow_sibling(
    sess: &TreeSession,
    txn: &mut Txn<'_>,
    root: &mut TreeRoot,
    parent: &BlockHandle,
    parent_slot: usize,
) -> Result<BlockHandle> {
    let (bytenr, gen) = {
        let data = parent.read();
        (
            layout::node_blockptr(&data, parent_slot).map_err(pe)?,
            layout::node_ptr_generation(&data, parent_slot).map_err(pe)?,
        )
    };
    let sibling = sess.read_tree_block(Bytenr(bytenr), Some(Generation(gen)))?;
    cow_block(
        sess,
        txn,
        root,
        &sibling,
        CowParent::Node(parent, parent_slot),
    )
}

/// Move tail items of the current leaf into its right sibling. Returns
/// [`PushOutcome::Pushed`] when the leaf holding the path's slot afterward
/// has at least `need` free bytes.
pub fn push_leaf_right(
    sess: &TreeSession,
    txn: &mut Txn<'_>,
    root: &mut TreeRoot,
    path: &mut Path,
    need: usize,
) -> Result<PushOutcome> {
    let leaf = path.leaf()?.clone();
    let Some(parent) = path.nodes[1].clone() else {
        return Ok(PushOutcome::NoRoom);
    };
    let pslot = path.slots[1];
    if pslot + 1 >= nritems_of(&parent)? {
        return Ok(PushOutcome::NoRoom);
    }
    let nritems = nritems_of(&leaf)?;
    if nritems < PUSH_MIN_ITEMS {
        return Ok(PushOutcome::NoRoom);
    }

    let right = cow_sibling(sess, txn, root, &parent, pslot + 1)?;
    let body = sess.body_size();
    let right_free = {
        let data = right.read();
        leaf_free_space(&data, body).map_err(pe)?
    };

    let count = {
        let data = leaf.read();
        let mut push_bytes = 0_usize;
        let mut count = 0_usize;
        for slot in (0..nritems).rev() {
            let kept = nritems - (count + 1);
            if kept < PUSH_DONOR_FLOOR && kept != 0 {
                break;
            }
            let size = u32_to_usize(layout::item_size(&data, slot).map_err(pe)?, "item_size")
                .map_err(pe)?;
            if push_bytes + size + ITEM_SIZE > right_free {
                break;
            }
            push_bytes += size + ITEM_SIZE;
            count += 1;
        }
        count
    };
    if count == 0 {
        return Ok(PushOutcome::NoRoom);
    }

    {
        let mut left = leaf.write();
        let mut right_data = right.write();
        leaf_push_tail_to_right(&mut left, &mut right_data, body, count).map_err(pe)?;
    }
    sess.mark_dirty(leaf.bytenr());
    sess.mark_dirty(right.bytenr());

    let right_first = {
        let data = right.read();
        layout::item_key(&data, 0).map_err(pe)?
    };
    {
        let mut data = parent.write();
        layout::set_node_key(&mut data, pslot + 1, &right_first).map_err(pe)?;
    }
    sess.mark_dirty(parent.bytenr());

    let left_remaining = nritems - count;
    if path.slots[0] >= left_remaining {
        path.nodes[0] = Some(right);
        path.slots[0] -= left_remaining;
        path.slots[1] += 1;
    }
    trace!(count, "leaf_push_right");

    let free_now = {
        let data = path.leaf()?.read();
        leaf_free_space(&data, body).map_err(pe)?
    };
    Ok(if free_now >= need {
        PushOutcome::Pushed
    } else {
        PushOutcome::NoRoom
    })
}

/// Move head items of the current leaf into its left sibling.
pub fn push_leaf_left(
    sess: &TreeSession,
    txn: &mut Txn<'_>,
    root: &mut TreeRoot,
    path: &mut Path,
    need: usize,
) -> Result<PushOutcome> {
    let leaf = path.leaf()?.clone();
    let Some(parent) = path.nodes[1].clone() else {
        return Ok(PushOutcome::NoRoom);
    };
    let pslot = path.slots[1];
    if pslot == 0 {
        return Ok(PushOutcome::NoRoom);
    }
    let nritems = nritems_of(&leaf)?;
    if nritems < PUSH_MIN_ITEMS {
        return Ok(PushOutcome::NoRoom);
    }

    let left = cow_sibling(sess, txn, root, &parent, pslot - 1)?;
    let body = sess.body_size();
    let left_free = {
        let data = left.read();
        leaf_free_space(&data, body).map_err(pe)?
    };
    let left_orig = nritems_of(&left)?;

    let count = {
        let data = leaf.read();
        let mut push_bytes = 0_usize;
        let mut count = 0_usize;
        for slot in 0..nritems {
            let kept = nritems - (count + 1);
            if kept < PUSH_DONOR_FLOOR && kept != 0 {
                break;
            }
            let size = u32_to_usize(layout::item_size(&data, slot).map_err(pe)?, "item_size")
                .map_err(pe)?;
            if push_bytes + size + ITEM_SIZE > left_free {
                break;
            }
            push_bytes += size + ITEM_SIZE;
            count += 1;
        }
        count
    };
    if count == 0 || count == nritems {
        // Emptying the leaf is the rebalance path's business, not a split
        // avoidance push.
        return Ok(PushOutcome::NoRoom);
    }

    {
        let mut left_data = left.write();
        let mut right_data = leaf.write();
        leaf_push_head_to_left(&mut left_data, &mut right_data, body, count).map_err(pe)?;
    }
    sess.mark_dirty(left.bytenr());
    sess.mark_dirty(leaf.bytenr());

    let new_first = {
        let data = leaf.read();
        layout::item_key(&data, 0).map_err(pe)?
    };
    fixup_low_keys(sess, path, &new_first, 1)?;

    if path.slots[0] < count {
        path.nodes[0] = Some(left);
        path.slots[0] += left_orig;
        path.slots[1] -= 1;
    } else {
        path.slots[0] -= count;
    }
    trace!(count, "leaf_push_left");

    let free_now = {
        let data = path.leaf()?.read();
        leaf_free_space(&data, body).map_err(pe)?
    };
    Ok(if free_now >= need {
        PushOutcome::Pushed
    } else {
        PushOutcome::NoRoom
    })
}

/// Pick a split point for a leaf of `nritems` items so the side that will
/// receive the operation at `slot` ends up with at least `need` free bytes.
/// Prefers the point closest to the middle.
fn choose_split(
    data: &[u8],
    nritems: usize,
    slot: usize,
    need: usize,
    body: usize,
) -> Result<Option<usize>> {
    let total = leaf_space_used(data, 0, nritems).map_err(pe)?;
    let mut best: Option<usize> = None;
    let mut used_prefix = 0_usize;
    for mid in 1..nritems {
        let size = u32_to_usize(layout::item_size(data, mid - 1).map_err(pe)?, "item_size")
            .map_err(pe)?;
        used_prefix += size + ITEM_SIZE;
        let fits = if slot < mid {
            body - used_prefix >= need
        } else {
            body - (total - used_prefix) >= need
        };
        if fits {
            let center = nritems / 2;
            let distance = mid.abs_diff(center);
            match best {
                Some(current) if current.abs_diff(center) <= distance => {}
                _ => best = Some(mid),
            }
        }
    }
    Ok(best)
}

/// Split the leaf at the bottom of `path` so that `need` bytes fit on the
/// side containing the target. `extend` means the target is an existing
/// item being grown rather than a new insertion.
pub fn split_leaf(
    sess: &TreeSession,
    txn: &mut Txn<'_>,
    root: &mut TreeRoot,
    path: &mut Path,
    key: &Key,
    need: usize,
    extend: bool,
) -> Result<()> {
    split_leaf_inner(sess, txn, root, path, key, need, extend, 0)
}

#[allow(clippy::too_many_arguments, clippy::too_many_lines)]
fn split_leaf_inner(
    sess: &TreeSession,
    txn: &mut Txn<'_>,
    root: &mut TreeRoot,
    path: &mut Path,
    key: &Key,
    need: usize,
    extend: bool,
    depth: u8,
) -> Result<()> {
    if depth > 1 {
        return Err(TreeError::NoSpace);
    }
    let body = sess.body_size();

    if !extend && depth == 0 {
        if let PushOutcome::Pushed = push_leaf_right(sess, txn, root, path, need)? {
            return Ok(());
        }
        if let PushOutcome::Pushed = push_leaf_left(sess, txn, root, path, need)? {
            return Ok(());
        }
    }

    let leaf = path.leaf()?.clone();
    let slot = path.slots[0];
    let nritems = nritems_of(&leaf)?;
    {
        let data = leaf.read();
        if leaf_free_space(&data, body).map_err(pe)? >= need {
            return Ok(());
        }
    }
    if need > body {
        return Err(TreeError::InvalidArgument(
            "item does not fit in an empty leaf".to_owned(),
        ));
    }

    // A split inserts one pointer into the parent; make sure it exists and
    // has room.
    if path.nodes[1].is_none() {
        insert_new_root(sess, txn, root, path)?;
    } else if nritems_of(path.node_at(1)?)? >= sess.node_capacity() {
        split_node(sess, txn, root, path, 1)?;
    }

    let (split, retry) = if !extend && slot == 0 && nritems > 0 {
        // Everything moves right; the incoming key takes over the emptied
        // leaf without rewriting low keys level by level.
        (0, false)
    } else if !extend && slot == nritems {
        // Append: a fresh empty right leaf keyed by the incoming key.
        (nritems, false)
    } else {
        let data = leaf.read();
        match choose_split(&data, nritems, slot, need, body)? {
            Some(mid) => (mid, false),
            // No single point works; split at the target and settle the
            // remainder with one more pass. A lone item that still lacks
            // room cannot be helped by splitting.
            None if nritems <= 1 => return Err(TreeError::NoSpace),
            None => (slot.max(1), true),
        }
    };

    let moved = nritems - split;
    let new = sess.alloc_tree_block(txn, root.id, 0, leaf.bytenr())?;
    {
        let mut left = leaf.write();
        let mut right = new.write();
        leaf_push_tail_to_right(&mut left, &mut right, body, moved).map_err(pe)?;
    }
    sess.mark_dirty(leaf.bytenr());

    let ptr_key = if moved > 0 {
        let data = new.read();
        layout::item_key(&data, 0).map_err(pe)?
    } else {
        *key
    };
    insert_ptr(
        sess,
        path,
        1,
        &ptr_key,
        new.bytenr(),
        txn.generation,
        path.slots[1] + 1,
    )?;

    if split == 0 && !extend {
        // The old leaf is empty and will receive the new smallest key.
        fixup_low_keys(sess, path, key, 1)?;
    } else if slot >= split {
        path.nodes[0] = Some(new);
        path.slots[0] = slot - split;
        path.slots[1] += 1;
    }
    debug!(split, moved, nritems, "leaf_split");

    if retry {
        let free = {
            let data = path.leaf()?.read();
            leaf_free_space(&data, body).map_err(pe)?
        };
        if free < need {
            return split_leaf_inner(sess, txn, root, path, key, need, extend, depth + 1);
        }
    }
    Ok(())
}

/// Rebalance an under-utilized leaf after a deletion: merge it entirely
/// into a sibling when one has room, otherwise leave it as is. An emptied
/// leaf is unlinked and freed.
pub(crate) fn rebalance_leaf(
    sess: &TreeSession,
    txn: &mut Txn<'_>,
    root: &mut TreeRoot,
    path: &mut Path,
) -> Result<()> {
    let leaf = path.leaf()?.clone();
    let Some(parent) = path.nodes[1].clone() else {
        return Ok(());
    };
    let pslot = path.slots[1];
    let nritems = nritems_of(&leaf)?;
    if nritems == 0 {
        path.nodes[0] = None;
        del_ptr(sess, txn, root, path, 1, pslot)?;
        free_block(sess, txn, root, leaf.bytenr(), 0)?;
        return Ok(());
    }
    let body = sess.body_size();
    let used = {
        let data = leaf.read();
        leaf_space_used(&data, 0, nritems).map_err(pe)?
    };

    if pslot > 0 {
        let left = cow_sibling(sess, txn, root, &parent, pslot - 1)?;
        let left_free = {
            let data = left.read();
            leaf_free_space(&data, body).map_err(pe)?
        };
        if left_free >= used {
            let left_orig = nritems_of(&left)?;
            {
                let mut left_data = left.write();
                let mut leaf_data = leaf.write();
                leaf_push_head_to_left(&mut left_data, &mut leaf_data, body, nritems)
                    .map_err(pe)?;
            }
            sess.mark_dirty(left.bytenr());
            path.nodes[0] = None;
            del_ptr(sess, txn, root, path, 1, pslot)?;
            free_block(sess, txn, root, leaf.bytenr(), 0)?;
            path.nodes[0] = Some(left);
            path.slots[0] += left_orig;
            path.slots[1] = pslot.saturating_sub(1);
            trace!(moved = nritems, "leaf_merge_left");
            return Ok(());
        }
    }

    if pslot + 1 < nritems_of(&parent)? {
        let right = cow_sibling(sess, txn, root, &parent, pslot + 1)?;
        let right_free = {
            let data = right.read();
            leaf_free_space(&data, body).map_err(pe)?
        };
        if right_free >= used {
            {
                let mut leaf_data = leaf.write();
                let mut right_data = right.write();
                leaf_push_tail_to_right(&mut leaf_data, &mut right_data, body, nritems)
                    .map_err(pe)?;
            }
            sess.mark_dirty(right.bytenr());
            path.nodes[0] = None;
            del_ptr(sess, txn, root, path, 1, pslot)?;
            free_block(sess, txn, root, leaf.bytenr(), 0)?;
            // The merged leaf's pointer shifted into pslot; its first key
            // is now the old leaf's first key.
            let right_first = {
                let data = right.read();
                layout::item_key(&data, 0).map_err(pe)?
            };
            path.nodes[0] = Some(right);
            path.slots[1] = pslot.min(nritems_of(&parent)?.saturating_sub(1));
            fixup_low_keys(sess, path, &right_first, 1)?;
            trace!(moved = nritems, "leaf_merge_right");
            return Ok(());
        }
    }
    Ok(())
}

/// Rebalance the node at `level` during a delete descent: merge with a
/// sibling when possible, steal pointers from a fuller neighbor otherwise,
/// and collapse the root when it is down to one child. May clear
/// `path.nodes[level]`, signalling the caller to restart the descent.
#[allow(clippy::too_many_lines)]
pub fn balance_level(
    sess: &TreeSession,
    txn: &mut Txn<'_>,
    root: &mut TreeRoot,
    path: &mut Path,
    level: usize,
) -> Result<()> {
    let block = path.node_at(level)?.clone();
    let nritems = nritems_of(&block)?;
    let capacity = sess.node_capacity();

    let is_root = path.nodes.get(level + 1).is_none_or(|n| n.is_none());
    if is_root {
        if nritems == 1 && level > 0 {
            // Promote the only child and drop a level.
            let (child_bytenr, child_gen) = {
                let data = block.read();
                (
                    layout::node_blockptr(&data, 0).map_err(pe)?,
                    layout::node_ptr_generation(&data, 0).map_err(pe)?,
                )
            };
            let child =
                sess.read_tree_block(Bytenr(child_bytenr), Some(Generation(child_gen)))?;
            root.bytenr = child.bytenr();
            root.level = u8::try_from(level - 1)
                .map_err(|_| TreeError::InvalidArgument("level underflow".to_owned()))?;
            root.generation = txn.generation;
            free_block(
                sess,
                txn,
                root,
                block.bytenr(),
                u8::try_from(level)
                    .map_err(|_| TreeError::InvalidArgument("level overflow".to_owned()))?,
            )?;
            path.nodes[level] = None;
            debug!(level = root.level, bytenr = root.bytenr.0, "root_collapse");
        }
        return Ok(());
    }
    if nritems >= capacity / 4 {
        return Ok(());
    }

    let parent = path.node_at(level + 1)?.clone();
    let pslot = path.slots[level + 1];
    let level_u8 = u8::try_from(level)
        .map_err(|_| TreeError::InvalidArgument("level overflow".to_owned()))?;

    // Merge into the left sibling when the combined pointers fit.
    if pslot > 0 {
        let left = cow_sibling(sess, txn, root, &parent, pslot - 1)?;
        let left_n = nritems_of(&left)?;
        if left_n + nritems <= capacity {
            {
                let mut left_data = left.write();
                let mut mid_data = block.write();
                node_push_head_to_left(&mut left_data, &mut mid_data, nritems).map_err(pe)?;
            }
            sess.mark_dirty(left.bytenr());
            path.nodes[level] = None;
            del_ptr(sess, txn, root, path, level + 1, pslot)?;
            free_block(sess, txn, root, block.bytenr(), level_u8)?;
            path.nodes[level] = Some(left);
            path.slots[level] += left_n;
            if path.nodes[level + 1].is_some() {
                path.slots[level + 1] = pslot - 1;
            }
            trace!(level, merged = nritems, "node_merge_left");
            return Ok(());
        }
        if left_n > nritems + 1 {
            // Steal from the fuller left neighbor.
            let steal = (left_n - nritems) / 2;
            {
                let mut left_data = left.write();
                let mut mid_data = block.write();
                node_push_tail_to_right(&mut left_data, &mut mid_data, steal).map_err(pe)?;
            }
            sess.mark_dirty(left.bytenr());
            sess.mark_dirty(block.bytenr());
            let new_first = {
                let data = block.read();
                layout::node_key(&data, 0).map_err(pe)?
            };
            fixup_low_keys(sess, path, &new_first, level + 1)?;
            path.slots[level] += steal;
            trace!(level, steal, "node_steal_left");
            return Ok(());
        }
    }

    if pslot + 1 < nritems_of(&parent)? {
        let right = cow_sibling(sess, txn, root, &parent, pslot + 1)?;
        let right_n = nritems_of(&right)?;
        if nritems + right_n <= capacity {
            {
                let mut mid_data = block.write();
                let mut right_data = right.write();
                node_push_head_to_left(&mut mid_data, &mut right_data, right_n).map_err(pe)?;
            }
            sess.mark_dirty(block.bytenr());
            del_ptr(sess, txn, root, path, level + 1, pslot + 1)?;
            free_block(sess, txn, root, right.bytenr(), level_u8)?;
            trace!(level, merged = right_n, "node_merge_right");
            return Ok(());
        }
        if right_n > nritems + 1 {
            let steal = (right_n - nritems) / 2;
            {
                let mut mid_data = block.write();
                let mut right_data = right.write();
                node_push_head_to_left(&mut mid_data, &mut right_data, steal).map_err(pe)?;
            }
            sess.mark_dirty(block.bytenr());
            sess.mark_dirty(right.bytenr());
            let right_first = {
                let data = right.read();
                layout::node_key(&data, 0).map_err(pe)?
            };
            {
                let mut parent_data = parent.write();
                layout::set_node_key(&mut parent_data, pslot + 1, &right_first).map_err(pe)?;
            }
            sess.mark_dirty(parent.bytenr());
            trace!(level, steal, "node_steal_right");
        }
    }
    Ok(())
}
