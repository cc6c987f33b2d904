//! Leaf item mutation.
//!
//! Inserting opens a gap in both the descriptor array and the packed
//! payload region; deleting closes one. The search layer guarantees the
//! space is there before any of this runs, so the functions here only do
//! layout surgery plus the parent-key fixups that keep the walk honest.

use crate::balance::{fixup_low_keys, rebalance_leaf};
use crate::node::{
    adjust_offsets, leaf_data_end, leaf_free_space, leaf_space_used, payload_boundary,
};
use crate::search::{search_slot, SearchOutcome};
use crate::{pe, Path, TreeRoot, TreeSession, Txn};
use cfs_error::{Result, TreeError};
use cfs_ondisk::layout;
use cfs_types::{
    u32_to_usize, Key, EXTENT_DATA_KEY, FILE_EXTENT_INLINE_DATA_START, HEADER_SIZE, ITEM_SIZE,
};
use tracing::trace;

fn leaf_nritems(data: &[u8]) -> Result<usize> {
    u32_to_usize(layout::header_nritems(data).map_err(pe)?, "nritems").map_err(pe)
}

/// Open a gap for `keys.len()` items at the path's slot and write their
/// descriptors, payload zeroed. The leaf must already have room.
fn setup_items(sess: &TreeSession, path: &Path, keys: &[Key], sizes: &[u32]) -> Result<()> {
    let leaf = path.leaf()?.clone();
    let body = sess.body_size();
    let count = keys.len();
    let slot = path.slots[0];

    let mut total_data = 0_usize;
    for size in sizes {
        total_data += u32_to_usize(*size, "item_size").map_err(pe)?;
    }

    {
        let mut data = leaf.write();
        let nritems = leaf_nritems(&data)?;
        if slot > nritems {
            return Err(TreeError::InvalidArgument(format!(
                "insert slot {slot} beyond {nritems} items"
            )));
        }
        if leaf_free_space(&data, body).map_err(pe)? < total_data + count * ITEM_SIZE {
            return Err(TreeError::NoSpace);
        }
        let data_end = leaf_data_end(&data, body).map_err(pe)?;
        let boundary = payload_boundary(&data, slot, body).map_err(pe)?;

        if slot < nritems {
            data.copy_within(
                HEADER_SIZE + slot * ITEM_SIZE..HEADER_SIZE + nritems * ITEM_SIZE,
                HEADER_SIZE + (slot + count) * ITEM_SIZE,
            );
            adjust_offsets(
                &mut data,
                slot + count,
                nritems + count,
                -(isize::try_from(total_data)
                    .map_err(|_| TreeError::InvalidArgument("payload too large".to_owned()))?),
            )
            .map_err(pe)?;
            data.copy_within(
                HEADER_SIZE + data_end..HEADER_SIZE + boundary,
                HEADER_SIZE + data_end - total_data,
            );
        }

        let mut offset = boundary;
        for (i, (key, size)) in keys.iter().zip(sizes).enumerate() {
            let size_usize = u32_to_usize(*size, "item_size").map_err(pe)?;
            offset -= size_usize;
            layout::set_item_key(&mut data, slot + i, key).map_err(pe)?;
            layout::set_item_offset(
                &mut data,
                slot + i,
                u32::try_from(offset)
                    .map_err(|_| TreeError::InvalidArgument("offset overflow".to_owned()))?,
            )
            .map_err(pe)?;
            layout::set_item_size(&mut data, slot + i, *size).map_err(pe)?;
            data[HEADER_SIZE + offset..HEADER_SIZE + offset + size_usize].fill(0);
        }

        layout::set_header_nritems(
            &mut data,
            u32::try_from(nritems + count)
                .map_err(|_| TreeError::InvalidArgument("nritems overflow".to_owned()))?,
        )
        .map_err(pe)?;
    }
    sess.mark_dirty(leaf.bytenr());
    if slot == 0 {
        fixup_low_keys(sess, path, &keys[0], 1)?;
    }
    Ok(())
}

/// Insert `keys.len()` zero-filled items, leaving the path positioned at
/// the first of them. Keys must be strictly ascending and absent from the
/// tree.
pub fn insert_empty_items(
    sess: &TreeSession,
    txn: &mut Txn<'_>,
    root: &mut TreeRoot,
    path: &mut Path,
    keys: &[Key],
    sizes: &[u32],
) -> Result<()> {
    if keys.is_empty() || keys.len() != sizes.len() {
        return Err(TreeError::InvalidArgument(
            "keys and sizes must be non-empty and match".to_owned(),
        ));
    }
    for pair in keys.windows(2) {
        if pair[0] >= pair[1] {
            return Err(TreeError::InvalidArgument(
                "insert keys out of order".to_owned(),
            ));
        }
    }

    let mut total = keys.len() * ITEM_SIZE;
    for size in sizes {
        total += u32_to_usize(*size, "item_size").map_err(pe)?;
    }
    let ins_len = i32::try_from(total)
        .map_err(|_| TreeError::InvalidArgument("insert larger than a leaf".to_owned()))?;

    match search_slot(sess, Some(txn), root, &keys[0], path, ins_len)? {
        SearchOutcome::Found => Err(TreeError::Exists(keys[0].to_string())),
        SearchOutcome::NotFound => setup_items(sess, path, keys, sizes),
    }
}

/// Insert one item with the given payload.
pub fn insert_item(
    sess: &TreeSession,
    txn: &mut Txn<'_>,
    root: &mut TreeRoot,
    key: &Key,
    payload: &[u8],
) -> Result<()> {
    let size = u32::try_from(payload.len())
        .map_err(|_| TreeError::InvalidArgument("payload too large".to_owned()))?;
    let mut path = Path::new();
    insert_empty_items(sess, txn, root, &mut path, &[*key], &[size])?;
    set_item_payload(sess, &path, payload)?;
    trace!(%key, size, "item_insert");
    Ok(())
}

/// Remove `count` items starting at `slot`, merging or unlinking the leaf
/// when the deletion leaves it under-used.
pub fn delete_items(
    sess: &TreeSession,
    txn: &mut Txn<'_>,
    root: &mut TreeRoot,
    path: &mut Path,
    slot: usize,
    count: usize,
) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    let leaf = path.leaf()?.clone();
    let body = sess.body_size();
    let remaining = {
        let mut data = leaf.write();
        let nritems = leaf_nritems(&data)?;
        if slot + count > nritems {
            return Err(TreeError::InvalidArgument(format!(
                "delete range {slot}+{count} beyond {nritems} items"
            )));
        }
        let removed_payload =
            leaf_space_used(&data, slot, slot + count).map_err(pe)? - count * ITEM_SIZE;

        if slot + count < nritems {
            let data_end = leaf_data_end(&data, body).map_err(pe)?;
            let removed_lo =
                u32_to_usize(layout::item_offset(&data, slot + count - 1).map_err(pe)?, "item_offset")
                    .map_err(pe)?;
            data.copy_within(
                HEADER_SIZE + data_end..HEADER_SIZE + removed_lo,
                HEADER_SIZE + data_end + removed_payload,
            );
            data.copy_within(
                HEADER_SIZE + (slot + count) * ITEM_SIZE..HEADER_SIZE + nritems * ITEM_SIZE,
                HEADER_SIZE + slot * ITEM_SIZE,
            );
            adjust_offsets(
                &mut data,
                slot,
                nritems - count,
                isize::try_from(removed_payload)
                    .map_err(|_| TreeError::InvalidArgument("payload too large".to_owned()))?,
            )
            .map_err(pe)?;
        }

        let remaining = nritems - count;
        layout::set_header_nritems(
            &mut data,
            u32::try_from(remaining)
                .map_err(|_| TreeError::InvalidArgument("nritems overflow".to_owned()))?,
        )
        .map_err(pe)?;
        remaining
    };
    sess.mark_dirty(leaf.bytenr());
    trace!(slot, count, remaining, "items_delete");

    if path.nodes[1].is_none() {
        // The root leaf may legitimately go empty.
        return Ok(());
    }
    if remaining == 0 {
        return rebalance_leaf(sess, txn, root, path);
    }
    if slot == 0 {
        let first = {
            let data = leaf.read();
            layout::item_key(&data, 0).map_err(pe)?
        };
        fixup_low_keys(sess, path, &first, 1)?;
    }
    let used = {
        let data = leaf.read();
        leaf_space_used(&data, 0, remaining).map_err(pe)?
    };
    if used < body / 4 {
        rebalance_leaf(sess, txn, root, path)?;
    }
    Ok(())
}

/// Look up `key` and remove its item.
pub fn delete_item(
    sess: &TreeSession,
    txn: &mut Txn<'_>,
    root: &mut TreeRoot,
    key: &Key,
) -> Result<()> {
    let mut path = Path::new();
    match search_slot(sess, Some(txn), root, key, &mut path, -1)? {
        SearchOutcome::Found => {
            let slot = path.slots[0];
            delete_items(sess, txn, root, &mut path, slot, 1)
        }
        SearchOutcome::NotFound => Err(TreeError::NotFound(key.to_string())),
    }
}

/// Grow the current item by `extra` bytes, appended (zeroed) at the end of
/// its payload. The leaf must already have the space; a mutating search
/// with the extra length as its insertion size guarantees that.
pub fn extend_item(sess: &TreeSession, path: &Path, extra: u32) -> Result<()> {
    if extra == 0 {
        return Ok(());
    }
    let leaf = path.leaf()?.clone();
    let body = sess.body_size();
    let slot = path.slots[0];
    let extra_usize = u32_to_usize(extra, "item_size").map_err(pe)?;
    {
        let mut data = leaf.write();
        let nritems = leaf_nritems(&data)?;
        if slot >= nritems {
            return Err(TreeError::NotPositioned);
        }
        if leaf_free_space(&data, body).map_err(pe)? < extra_usize {
            return Err(TreeError::NoSpace);
        }
        let data_end = leaf_data_end(&data, body).map_err(pe)?;
        let offset =
            u32_to_usize(layout::item_offset(&data, slot).map_err(pe)?, "item_offset").map_err(pe)?;
        let size =
            u32_to_usize(layout::item_size(&data, slot).map_err(pe)?, "item_size").map_err(pe)?;
        let payload_end = offset + size;

        // Shift this item's payload and everything packed below it, which
        // opens the gap at the payload's tail.
        data.copy_within(
            HEADER_SIZE + data_end..HEADER_SIZE + payload_end,
            HEADER_SIZE + data_end - extra_usize,
        );
        adjust_offsets(
            &mut data,
            slot,
            nritems,
            -(isize::try_from(extra_usize)
                .map_err(|_| TreeError::InvalidArgument("payload too large".to_owned()))?),
        )
        .map_err(pe)?;
        layout::set_item_size(
            &mut data,
            slot,
            u32::try_from(size + extra_usize)
                .map_err(|_| TreeError::InvalidArgument("item size overflow".to_owned()))?,
        )
        .map_err(pe)?;
        data[HEADER_SIZE + payload_end - extra_usize..HEADER_SIZE + payload_end].fill(0);
    }
    sess.mark_dirty(leaf.bytenr());
    Ok(())
}

/// Shrink the current item to `new_size` bytes. `from_tail` keeps the
/// leading bytes; otherwise the trailing bytes survive, except that an
/// `EXTENT_DATA` item's fixed header is carried along so only its inline
/// data loses its head.
pub fn truncate_item(
    sess: &TreeSession,
    path: &Path,
    new_size: u32,
    from_tail: bool,
) -> Result<()> {
    let leaf = path.leaf()?.clone();
    let body = sess.body_size();
    let slot = path.slots[0];
    {
        let mut data = leaf.write();
        let nritems = leaf_nritems(&data)?;
        if slot >= nritems {
            return Err(TreeError::NotPositioned);
        }
        let offset =
            u32_to_usize(layout::item_offset(&data, slot).map_err(pe)?, "item_offset").map_err(pe)?;
        let size =
            u32_to_usize(layout::item_size(&data, slot).map_err(pe)?, "item_size").map_err(pe)?;
        let new_usize = u32_to_usize(new_size, "item_size").map_err(pe)?;
        if new_usize > size {
            return Err(TreeError::InvalidArgument(
                "truncate cannot grow an item".to_owned(),
            ));
        }
        if new_usize == size {
            return Ok(());
        }
        let delta = size - new_usize;

        if from_tail {
            // Keep the front: slide it (and all payload packed below) up
            // against the unchanged boundary.
            let data_end = leaf_data_end(&data, body).map_err(pe)?;
            data.copy_within(
                HEADER_SIZE + data_end..HEADER_SIZE + offset + new_usize,
                HEADER_SIZE + data_end + delta,
            );
            adjust_offsets(
                &mut data,
                slot,
                nritems,
                isize::try_from(delta)
                    .map_err(|_| TreeError::InvalidArgument("payload too large".to_owned()))?,
            )
            .map_err(pe)?;
        } else {
            // Keep the tail in place; only the descriptor moves.
            let key = layout::item_key(&data, slot).map_err(pe)?;
            if key.item_type == EXTENT_DATA_KEY && new_usize >= FILE_EXTENT_INLINE_DATA_START {
                data.copy_within(
                    HEADER_SIZE + offset..HEADER_SIZE + offset + FILE_EXTENT_INLINE_DATA_START,
                    HEADER_SIZE + offset + delta,
                );
            }
            layout::set_item_offset(
                &mut data,
                slot,
                u32::try_from(offset + delta)
                    .map_err(|_| TreeError::InvalidArgument("offset overflow".to_owned()))?,
            )
            .map_err(pe)?;
        }
        layout::set_item_size(&mut data, slot, new_size).map_err(pe)?;
    }
    sess.mark_dirty(leaf.bytenr());
    Ok(())
}

/// Split the current item in two at `split_offset` payload bytes. The
/// first part keeps the original key; the second gets `new_key` and the
/// remaining bytes. The path stays on the first part.
pub fn split_item(
    sess: &TreeSession,
    txn: &mut Txn<'_>,
    root: &mut TreeRoot,
    path: &mut Path,
    new_key: &Key,
    split_offset: u32,
) -> Result<()> {
    let orig_key = crate::current_key(path)?;
    if *new_key <= orig_key {
        return Err(TreeError::InvalidArgument(
            "split key must sort after the original".to_owned(),
        ));
    }
    {
        let leaf = path.leaf()?;
        let data = leaf.read();
        let nritems = leaf_nritems(&data)?;
        let slot = path.slots[0];
        if slot + 1 < nritems {
            let next = layout::item_key(&data, slot + 1).map_err(pe)?;
            if *new_key >= next {
                return Err(TreeError::InvalidArgument(
                    "split key must sort before the next item".to_owned(),
                ));
            }
        }
    }

    // One extra descriptor has to fit; a mutating search on the original
    // key makes room, splitting the leaf if necessary.
    let free = {
        let leaf = path.leaf()?;
        let data = leaf.read();
        leaf_free_space(&data, sess.body_size()).map_err(pe)?
    };
    if free < ITEM_SIZE {
        path.release();
        let ins = i32::try_from(ITEM_SIZE)
            .map_err(|_| TreeError::InvalidArgument("insert length overflow".to_owned()))?;
        match search_slot(sess, Some(txn), root, &orig_key, path, ins)? {
            SearchOutcome::Found => {}
            SearchOutcome::NotFound => return Err(TreeError::NotFound(orig_key.to_string())),
        }
    }

    let payload = item_payload(path)?;
    let split = u32_to_usize(split_offset, "item_size").map_err(pe)?;
    if split == 0 || split >= payload.len() {
        return Err(TreeError::InvalidArgument(
            "split offset outside the payload".to_owned(),
        ));
    }
    let tail = payload[split..].to_vec();
    let tail_size = u32::try_from(tail.len())
        .map_err(|_| TreeError::InvalidArgument("payload too large".to_owned()))?;

    truncate_item(sess, path, split_offset, true)?;
    path.slots[0] += 1;
    setup_items(sess, path, &[*new_key], &[tail_size])?;
    set_item_payload(sess, path, &tail)?;
    path.slots[0] -= 1;
    trace!(%orig_key, %new_key, split_offset, "item_split");
    Ok(())
}

/// Rewrite the current item's key after checking it keeps the leaf sorted.
/// The path must come from a mutating search.
pub fn set_item_key_safe(sess: &TreeSession, path: &Path, new_key: &Key) -> Result<()> {
    let leaf = path.leaf()?.clone();
    let slot = path.slots[0];
    {
        let data = leaf.read();
        let nritems = leaf_nritems(&data)?;
        if slot >= nritems {
            return Err(TreeError::NotPositioned);
        }
        if slot > 0 {
            let prev = layout::item_key(&data, slot - 1).map_err(pe)?;
            if prev >= *new_key {
                return Err(TreeError::InvalidArgument(
                    "new key must sort after the previous item".to_owned(),
                ));
            }
        }
        if slot + 1 < nritems {
            let next = layout::item_key(&data, slot + 1).map_err(pe)?;
            if next <= *new_key {
                return Err(TreeError::InvalidArgument(
                    "new key must sort before the next item".to_owned(),
                ));
            }
        }
    }
    {
        let mut data = leaf.write();
        layout::set_item_key(&mut data, slot, new_key).map_err(pe)?;
    }
    sess.mark_dirty(leaf.bytenr());
    if slot == 0 {
        fixup_low_keys(sess, path, new_key, 1)?;
    }
    Ok(())
}

/// Rewrite the current item's key with no ordering checks. Corruption
/// injection for tests and repair tooling; never part of a normal descent.
pub fn set_item_key_unchecked(sess: &TreeSession, path: &Path, new_key: &Key) -> Result<()> {
    let leaf = path.leaf()?.clone();
    {
        let mut data = leaf.write();
        layout::set_item_key(&mut data, path.slots[0], new_key).map_err(pe)?;
    }
    sess.mark_dirty(leaf.bytenr());
    Ok(())
}

/// Copy out the current item's payload.
pub fn item_payload(path: &Path) -> Result<Vec<u8>> {
    let leaf = path.leaf()?;
    let data = leaf.read();
    let slot = path.slots[0];
    let nritems = leaf_nritems(&data)?;
    if slot >= nritems {
        return Err(TreeError::NotPositioned);
    }
    let offset =
        u32_to_usize(layout::item_offset(&data, slot).map_err(pe)?, "item_offset").map_err(pe)?;
    let size = u32_to_usize(layout::item_size(&data, slot).map_err(pe)?, "item_size").map_err(pe)?;
    Ok(data[HEADER_SIZE + offset..HEADER_SIZE + offset + size].to_vec())
}

/// Overwrite the current item's payload. The length must match the item
/// size exactly.
pub fn set_item_payload(sess: &TreeSession, path: &Path, payload: &[u8]) -> Result<()> {
    let leaf = path.leaf()?.clone();
    let slot = path.slots[0];
    {
        let mut data = leaf.write();
        let nritems = leaf_nritems(&data)?;
        if slot >= nritems {
            return Err(TreeError::NotPositioned);
        }
        let offset =
            u32_to_usize(layout::item_offset(&data, slot).map_err(pe)?, "item_offset").map_err(pe)?;
        let size =
            u32_to_usize(layout::item_size(&data, slot).map_err(pe)?, "item_size").map_err(pe)?;
        if size != payload.len() {
            return Err(TreeError::InvalidArgument(format!(
                "payload length {} does not match item size {size}",
                payload.len()
            )));
        }
        data[HEADER_SIZE + offset..HEADER_SIZE + offset + size].copy_from_slice(payload);
    }
    sess.mark_dirty(leaf.bytenr());
    Ok(())
}

/// Search for `key` and copy out its payload if present.
pub fn lookup_item(
    sess: &TreeSession,
    root: &mut TreeRoot,
    key: &Key,
) -> Result<Option<Vec<u8>>> {
    let mut path = Path::new();
    match search_slot(sess, None, root, key, &mut path, 0)? {
        SearchOutcome::Found => Ok(Some(item_payload(&path)?)),
        SearchOutcome::NotFound => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{make_allocator, make_session};
    use crate::{LinearAllocator, NoRefTracking};
    use cfs_types::{Generation, TreeId, DIR_ITEM_KEY};

    fn txn<'a>(
        alloc: &'a mut LinearAllocator,
        refs: &'a mut NoRefTracking,
        generation: u64,
    ) -> Txn<'a> {
        Txn {
            generation: Generation(generation),
            alloc,
            refs,
        }
    }

    #[test]
    fn insert_and_lookup_single_item() {
        let sess = make_session();
        let mut alloc = make_allocator();
        let mut refs = NoRefTracking;
        let mut t = txn(&mut alloc, &mut refs, 1);
        let mut root = sess.create_tree(&mut t, TreeId::FS_TREE).expect("create");

        let key = Key::new(42, DIR_ITEM_KEY, 7);
        insert_item(&sess, &mut t, &mut root, &key, b"hello").expect("insert");

        let payload = lookup_item(&sess, &mut root, &key).expect("lookup");
        assert_eq!(payload.as_deref(), Some(b"hello".as_slice()));
        assert_eq!(
            lookup_item(&sess, &mut root, &Key::new(42, DIR_ITEM_KEY, 8)).expect("lookup"),
            None
        );
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let sess = make_session();
        let mut alloc = make_allocator();
        let mut refs = NoRefTracking;
        let mut t = txn(&mut alloc, &mut refs, 1);
        let mut root = sess.create_tree(&mut t, TreeId::FS_TREE).expect("create");

        let key = Key::new(1, DIR_ITEM_KEY, 0);
        insert_item(&sess, &mut t, &mut root, &key, b"a").expect("insert");
        assert!(matches!(
            insert_item(&sess, &mut t, &mut root, &key, b"b"),
            Err(TreeError::Exists(_))
        ));
    }

    #[test]
    fn many_inserts_split_leaves_and_stay_retrievable() {
        let sess = make_session();
        let mut alloc = make_allocator();
        let mut refs = NoRefTracking;
        let mut t = txn(&mut alloc, &mut refs, 1);
        let mut root = sess.create_tree(&mut t, TreeId::FS_TREE).expect("create");

        // Enough 100-byte payloads to overflow several 4 KiB leaves.
        for i in 0..200_u64 {
            let key = Key::new(1, DIR_ITEM_KEY, i);
            let payload = vec![u8::try_from(i % 251).expect("fits"); 100];
            insert_item(&sess, &mut t, &mut root, &key, &payload).expect("insert");
        }
        assert!(root.level >= 1, "the tree grew past a single leaf");

        for i in 0..200_u64 {
            let key = Key::new(1, DIR_ITEM_KEY, i);
            let payload = lookup_item(&sess, &mut root, &key)
                .expect("lookup")
                .unwrap_or_else(|| panic!("item {i} missing"));
            assert_eq!(payload, vec![u8::try_from(i % 251).expect("fits"); 100]);
        }
    }

    #[test]
    fn out_of_order_inserts_keep_sorted_iteration() {
        let sess = make_session();
        let mut alloc = make_allocator();
        let mut refs = NoRefTracking;
        let mut t = txn(&mut alloc, &mut refs, 1);
        let mut root = sess.create_tree(&mut t, TreeId::FS_TREE).expect("create");

        // Descending insertion exercises the slot-0 split path.
        for i in (0..120_u64).rev() {
            let key = Key::new(5, DIR_ITEM_KEY, i);
            insert_item(&sess, &mut t, &mut root, &key, &[u8::try_from(i % 251).expect("fits"); 64])
                .expect("insert");
        }

        let mut path = Path::new();
        let outcome = search_slot(
            &sess,
            None,
            &mut root,
            &Key::new(5, DIR_ITEM_KEY, 0),
            &mut path,
            0,
        )
        .expect("search");
        assert_eq!(outcome, SearchOutcome::Found);
        let mut seen = Vec::new();
        loop {
            seen.push(crate::current_key(&path).expect("key"));
            let nritems = {
                let data = path.leaf().expect("leaf").read();
                leaf_nritems(&data).expect("n")
            };
            if path.slots[0] + 1 < nritems {
                path.slots[0] += 1;
            } else if !crate::search::next_leaf(&sess, &mut path).expect("walk") {
                break;
            }
            assert!(seen.len() <= 500, "runaway iteration");
        }
        assert_eq!(seen.len(), 120);
        // Keys come back strictly ascending.
        for pair in seen.windows(2) {
            assert!(pair[0] < pair[1], "iteration out of order: {pair:?}");
        }
    }

    #[test]
    fn delete_collapses_back_to_a_leaf() {
        let sess = make_session();
        let mut alloc = make_allocator();
        let mut refs = NoRefTracking;
        let mut t = txn(&mut alloc, &mut refs, 1);
        let mut root = sess.create_tree(&mut t, TreeId::FS_TREE).expect("create");

        for i in 0..150_u64 {
            let key = Key::new(9, DIR_ITEM_KEY, i);
            insert_item(&sess, &mut t, &mut root, &key, &[0xAB; 96]).expect("insert");
        }
        assert!(root.level >= 1);

        for i in 0..150_u64 {
            delete_item(&sess, &mut t, &mut root, &Key::new(9, DIR_ITEM_KEY, i))
                .expect("delete");
        }
        assert_eq!(root.level, 0, "tree collapsed back to a single leaf");
        assert_eq!(
            lookup_item(&sess, &mut root, &Key::new(9, DIR_ITEM_KEY, 0)).expect("lookup"),
            None
        );
    }

    #[test]
    fn deleting_a_missing_key_reports_not_found() {
        let sess = make_session();
        let mut alloc = make_allocator();
        let mut refs = NoRefTracking;
        let mut t = txn(&mut alloc, &mut refs, 1);
        let mut root = sess.create_tree(&mut t, TreeId::FS_TREE).expect("create");

        insert_item(&sess, &mut t, &mut root, &Key::new(1, DIR_ITEM_KEY, 1), b"x")
            .expect("insert");
        assert!(matches!(
            delete_item(&sess, &mut t, &mut root, &Key::new(1, DIR_ITEM_KEY, 2)),
            Err(TreeError::NotFound(_))
        ));
    }

    #[test]
    fn extend_appends_zeroed_bytes() {
        let sess = make_session();
        let mut alloc = make_allocator();
        let mut refs = NoRefTracking;
        let mut t = txn(&mut alloc, &mut refs, 1);
        let mut root = sess.create_tree(&mut t, TreeId::FS_TREE).expect("create");

        let key = Key::new(3, DIR_ITEM_KEY, 3);
        insert_item(&sess, &mut t, &mut root, &key, b"abc").expect("insert");
        insert_item(&sess, &mut t, &mut root, &Key::new(3, DIR_ITEM_KEY, 4), b"zz")
            .expect("insert");

        let mut path = Path::new();
        let outcome = search_slot(&sess, Some(&mut t), &mut root, &key, &mut path, 5)
            .expect("search");
        assert_eq!(outcome, SearchOutcome::Found);
        extend_item(&sess, &path, 5).expect("extend");

        assert_eq!(
            item_payload(&path).expect("payload"),
            b"abc\0\0\0\0\0".to_vec()
        );
        // The neighbor is untouched.
        assert_eq!(
            lookup_item(&sess, &mut root, &Key::new(3, DIR_ITEM_KEY, 4)).expect("lookup"),
            Some(b"zz".to_vec())
        );
    }

    #[test]
    fn truncate_keeps_the_requested_end() {
        let sess = make_session();
        let mut alloc = make_allocator();
        let mut refs = NoRefTracking;
        let mut t = txn(&mut alloc, &mut refs, 1);
        let mut root = sess.create_tree(&mut t, TreeId::FS_TREE).expect("create");

        let front = Key::new(4, DIR_ITEM_KEY, 1);
        let back = Key::new(4, DIR_ITEM_KEY, 2);
        insert_item(&sess, &mut t, &mut root, &front, b"ABCDEFGH").expect("insert");
        insert_item(&sess, &mut t, &mut root, &back, b"12345678").expect("insert");

        let mut path = Path::new();
        search_slot(&sess, Some(&mut t), &mut root, &front, &mut path, 1).expect("search");
        truncate_item(&sess, &path, 3, true).expect("truncate tail");
        assert_eq!(item_payload(&path).expect("payload"), b"ABC".to_vec());

        path.release();
        search_slot(&sess, Some(&mut t), &mut root, &back, &mut path, 1).expect("search");
        truncate_item(&sess, &path, 3, false).expect("truncate head");
        assert_eq!(item_payload(&path).expect("payload"), b"678".to_vec());
    }

    #[test]
    fn split_item_divides_payload_between_two_keys() {
        let sess = make_session();
        let mut alloc = make_allocator();
        let mut refs = NoRefTracking;
        let mut t = txn(&mut alloc, &mut refs, 1);
        let mut root = sess.create_tree(&mut t, TreeId::FS_TREE).expect("create");

        let key = Key::new(7, DIR_ITEM_KEY, 10);
        insert_item(&sess, &mut t, &mut root, &key, b"frontback").expect("insert");

        let mut path = Path::new();
        search_slot(&sess, Some(&mut t), &mut root, &key, &mut path, 1).expect("search");
        let new_key = Key::new(7, DIR_ITEM_KEY, 15);
        split_item(&sess, &mut t, &mut root, &mut path, &new_key, 5).expect("split");

        assert_eq!(
            lookup_item(&sess, &mut root, &key).expect("lookup"),
            Some(b"front".to_vec())
        );
        assert_eq!(
            lookup_item(&sess, &mut root, &new_key).expect("lookup"),
            Some(b"back".to_vec())
        );
    }

    #[test]
    fn set_item_key_safe_rejects_order_violations() {
        let sess = make_session();
        let mut alloc = make_allocator();
        let mut refs = NoRefTracking;
        let mut t = txn(&mut alloc, &mut refs, 1);
        let mut root = sess.create_tree(&mut t, TreeId::FS_TREE).expect("create");

        insert_item(&sess, &mut t, &mut root, &Key::new(1, DIR_ITEM_KEY, 1), b"a")
            .expect("insert");
        insert_item(&sess, &mut t, &mut root, &Key::new(1, DIR_ITEM_KEY, 5), b"b")
            .expect("insert");
        insert_item(&sess, &mut t, &mut root, &Key::new(1, DIR_ITEM_KEY, 9), b"c")
            .expect("insert");

        let mut path = Path::new();
        search_slot(
            &sess,
            Some(&mut t),
            &mut root,
            &Key::new(1, DIR_ITEM_KEY, 5),
            &mut path,
            1,
        )
        .expect("search");

        assert!(set_item_key_safe(&sess, &path, &Key::new(1, DIR_ITEM_KEY, 9)).is_err());
        assert!(set_item_key_safe(&sess, &path, &Key::new(1, DIR_ITEM_KEY, 1)).is_err());
        set_item_key_safe(&sess, &path, &Key::new(1, DIR_ITEM_KEY, 6)).expect("rekey");
        assert_eq!(crate::current_key(&path).expect("key"), Key::new(1, DIR_ITEM_KEY, 6));
    }
}
