//! Raw byte movers for tree blocks.
//!
//! Everything here is pure arithmetic over one or two block buffers. The
//! leaf layout makes these delicate: item descriptors grow forward from the
//! body start while payload packs backward from the body end, so moving
//! items between leaves shifts payload one way and descriptors the other,
//! with every surviving descriptor's offset corrected by the payload delta.
//!
//! Callers are responsible for the fit checks (free space, capacity) and for
//! parent-key fixups; these functions only guard against buffer overruns.

use cfs_ondisk::layout::{
    header_nritems, item_offset, item_size, set_header_nritems, set_item_offset,
};
use cfs_types::{u32_to_usize, ParseError, HEADER_SIZE, ITEM_SIZE, KEY_PTR_SIZE};

/// End of the free region in a leaf: the lowest payload offset, relative to
/// the body start. An empty leaf's data end is the full body.
pub fn leaf_data_end(block: &[u8], body: usize) -> Result<usize, ParseError> {
    let nritems = u32_to_usize(header_nritems(block)?, "nritems")?;
    if nritems == 0 {
        Ok(body)
    } else {
        u32_to_usize(item_offset(block, nritems - 1)?, "item_offset")
    }
}

/// Free bytes between the last descriptor and the first payload byte.
pub fn leaf_free_space(block: &[u8], body: usize) -> Result<usize, ParseError> {
    let nritems = u32_to_usize(header_nritems(block)?, "nritems")?;
    let data_end = leaf_data_end(block, body)?;
    nritems
        .checked_mul(ITEM_SIZE)
        .and_then(|descriptors| data_end.checked_sub(descriptors))
        .ok_or(ParseError::InvalidField {
            field: "free_space",
            reason: "descriptors overrun payload",
        })
}

/// Bytes consumed by items in `[from, to)`: descriptors plus payload.
pub fn leaf_space_used(block: &[u8], from: usize, to: usize) -> Result<usize, ParseError> {
    let mut total = 0_usize;
    for slot in from..to {
        let size = u32_to_usize(item_size(block, slot)?, "item_size")?;
        total = total
            .checked_add(ITEM_SIZE + size)
            .ok_or(ParseError::InvalidField {
                field: "item_size",
                reason: "space accounting overflow",
            })?;
    }
    Ok(total)
}

/// Payload end boundary for `slot`: the previous item's offset, or the body
/// size for slot 0.
pub(crate) fn payload_boundary(block: &[u8], slot: usize, body: usize) -> Result<usize, ParseError> {
    if slot == 0 {
        Ok(body)
    } else {
        u32_to_usize(item_offset(block, slot - 1)?, "item_offset")
    }
}

pub(crate) fn adjust_offsets(
    block: &mut [u8],
    from: usize,
    to: usize,
    delta: isize,
) -> Result<(), ParseError> {
    for slot in from..to {
        let old = i64::from(item_offset(block, slot)?);
        let adjusted = old
            .checked_add(delta as i64)
            .filter(|v| *v >= 0)
            .ok_or(ParseError::InvalidField {
                field: "item_offset",
                reason: "offset adjustment underflow",
            })?;
        let adjusted = u32::try_from(adjusted)
            .map_err(|_| ParseError::IntegerConversion { field: "item_offset" })?;
        set_item_offset(block, slot, adjusted)?;
    }
    Ok(())
}

/// Move the tail `count` items of `left` to the head of `right`.
///
/// `right` may be empty (this is how a leaf split populates the new block).
/// The caller must have verified that `right` has room for the descriptors
/// plus the payload bytes.
pub fn leaf_push_tail_to_right(
    left: &mut [u8],
    right: &mut [u8],
    body: usize,
    count: usize,
) -> Result<(), ParseError> {
    if count == 0 {
        return Ok(());
    }
    let n_left = u32_to_usize(header_nritems(left)?, "nritems")?;
    let n_right = u32_to_usize(header_nritems(right)?, "nritems")?;
    if count > n_left {
        return Err(ParseError::InvalidField {
            field: "count",
            reason: "more items than the donor holds",
        });
    }

    let src_lo = u32_to_usize(item_offset(left, n_left - 1)?, "item_offset")?;
    let src_hi = payload_boundary(left, n_left - count, body)?;
    let push_bytes = src_hi
        .checked_sub(src_lo)
        .ok_or(ParseError::InvalidField {
            field: "item_offset",
            reason: "tail payload range inverted",
        })?;
    if leaf_free_space(right, body)? < push_bytes + count * ITEM_SIZE {
        return Err(ParseError::InvalidField {
            field: "free_space",
            reason: "receiver cannot hold the pushed items",
        });
    }
    let right_data_end = leaf_data_end(right, body)?;

    // Make room at the head of the receiver.
    right.copy_within(
        HEADER_SIZE..HEADER_SIZE + n_right * ITEM_SIZE,
        HEADER_SIZE + count * ITEM_SIZE,
    );
    adjust_offsets(right, count, count + n_right, -(push_bytes as isize))?;
    right.copy_within(
        HEADER_SIZE + right_data_end..HEADER_SIZE + body,
        HEADER_SIZE + right_data_end - push_bytes,
    );

    // Bring over the donor's tail payload and descriptors.
    right[HEADER_SIZE + body - push_bytes..HEADER_SIZE + body]
        .copy_from_slice(&left[HEADER_SIZE + src_lo..HEADER_SIZE + src_hi]);
    right[HEADER_SIZE..HEADER_SIZE + count * ITEM_SIZE].copy_from_slice(
        &left[HEADER_SIZE + (n_left - count) * ITEM_SIZE..HEADER_SIZE + n_left * ITEM_SIZE],
    );
    adjust_offsets(right, 0, count, body as isize - src_hi as isize)?;

    set_header_nritems(right, u32::try_from(n_right + count).map_err(|_| {
        ParseError::IntegerConversion { field: "nritems" }
    })?)?;
    set_header_nritems(left, u32::try_from(n_left - count).map_err(|_| {
        ParseError::IntegerConversion { field: "nritems" }
    })?)?;
    Ok(())
}

/// Move the head `count` items of `right` to the tail of `left`.
pub fn leaf_push_head_to_left(
    left: &mut [u8],
    right: &mut [u8],
    body: usize,
    count: usize,
) -> Result<(), ParseError> {
    if count == 0 {
        return Ok(());
    }
    let n_left = u32_to_usize(header_nritems(left)?, "nritems")?;
    let n_right = u32_to_usize(header_nritems(right)?, "nritems")?;
    if count > n_right {
        return Err(ParseError::InvalidField {
            field: "count",
            reason: "more items than the donor holds",
        });
    }

    let src_lo = u32_to_usize(item_offset(right, count - 1)?, "item_offset")?;
    let push_bytes = body
        .checked_sub(src_lo)
        .ok_or(ParseError::InvalidField {
            field: "item_offset",
            reason: "head payload range inverted",
        })?;
    if leaf_free_space(left, body)? < push_bytes + count * ITEM_SIZE {
        return Err(ParseError::InvalidField {
            field: "free_space",
            reason: "receiver cannot hold the pushed items",
        });
    }
    let left_data_end = leaf_data_end(left, body)?;
    let right_data_end = leaf_data_end(right, body)?;

    // Append payload and descriptors to the receiver.
    left[HEADER_SIZE + left_data_end - push_bytes..HEADER_SIZE + left_data_end]
        .copy_from_slice(&right[HEADER_SIZE + src_lo..HEADER_SIZE + body]);
    left[HEADER_SIZE + n_left * ITEM_SIZE..HEADER_SIZE + (n_left + count) * ITEM_SIZE]
        .copy_from_slice(&right[HEADER_SIZE..HEADER_SIZE + count * ITEM_SIZE]);
    adjust_offsets(
        left,
        n_left,
        n_left + count,
        left_data_end as isize - body as isize,
    )?;

    // Close the donor's head: payload shifts back toward the body end,
    // descriptors shift toward the body start.
    right.copy_within(
        HEADER_SIZE + right_data_end..HEADER_SIZE + src_lo,
        HEADER_SIZE + right_data_end + push_bytes,
    );
    right.copy_within(
        HEADER_SIZE + count * ITEM_SIZE..HEADER_SIZE + n_right * ITEM_SIZE,
        HEADER_SIZE,
    );
    adjust_offsets(right, 0, n_right - count, push_bytes as isize)?;

    set_header_nritems(left, u32::try_from(n_left + count).map_err(|_| {
        ParseError::IntegerConversion { field: "nritems" }
    })?)?;
    set_header_nritems(right, u32::try_from(n_right - count).map_err(|_| {
        ParseError::IntegerConversion { field: "nritems" }
    })?)?;
    Ok(())
}

/// Move the tail `count` key-pointers of `left` to the head of `right`.
pub fn node_push_tail_to_right(
    left: &mut [u8],
    right: &mut [u8],
    count: usize,
) -> Result<(), ParseError> {
    if count == 0 {
        return Ok(());
    }
    let n_left = u32_to_usize(header_nritems(left)?, "nritems")?;
    let n_right = u32_to_usize(header_nritems(right)?, "nritems")?;
    if count > n_left {
        return Err(ParseError::InvalidField {
            field: "count",
            reason: "more pointers than the donor holds",
        });
    }

    right.copy_within(
        HEADER_SIZE..HEADER_SIZE + n_right * KEY_PTR_SIZE,
        HEADER_SIZE + count * KEY_PTR_SIZE,
    );
    right[HEADER_SIZE..HEADER_SIZE + count * KEY_PTR_SIZE].copy_from_slice(
        &left[HEADER_SIZE + (n_left - count) * KEY_PTR_SIZE
            ..HEADER_SIZE + n_left * KEY_PTR_SIZE],
    );
    set_header_nritems(right, u32::try_from(n_right + count).map_err(|_| {
        ParseError::IntegerConversion { field: "nritems" }
    })?)?;
    set_header_nritems(left, u32::try_from(n_left - count).map_err(|_| {
        ParseError::IntegerConversion { field: "nritems" }
    })?)?;
    Ok(())
}

/// Move the head `count` key-pointers of `right` to the tail of `left`.
pub fn node_push_head_to_left(
    left: &mut [u8],
    right: &mut [u8],
    count: usize,
) -> Result<(), ParseError> {
    if count == 0 {
        return Ok(());
    }
    let n_left = u32_to_usize(header_nritems(left)?, "nritems")?;
    let n_right = u32_to_usize(header_nritems(right)?, "nritems")?;
    if count > n_right {
        return Err(ParseError::InvalidField {
            field: "count",
            reason: "more pointers than the donor holds",
        });
    }

    left[HEADER_SIZE + n_left * KEY_PTR_SIZE..HEADER_SIZE + (n_left + count) * KEY_PTR_SIZE]
        .copy_from_slice(&right[HEADER_SIZE..HEADER_SIZE + count * KEY_PTR_SIZE]);
    right.copy_within(
        HEADER_SIZE + count * KEY_PTR_SIZE..HEADER_SIZE + n_right * KEY_PTR_SIZE,
        HEADER_SIZE,
    );
    set_header_nritems(left, u32::try_from(n_left + count).map_err(|_| {
        ParseError::IntegerConversion { field: "nritems" }
    })?)?;
    set_header_nritems(right, u32::try_from(n_right - count).map_err(|_| {
        ParseError::IntegerConversion { field: "nritems" }
    })?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_ondisk::layout::{
        item_key, set_header_level, set_item_key, set_item_size, set_node_blockptr, set_node_key,
    };
    use cfs_types::Key;

    const BODY: usize = 4096 - HEADER_SIZE;

    fn empty_leaf() -> Vec<u8> {
        let mut block = vec![0_u8; 4096];
        set_header_level(&mut block, 0).expect("level");
        block
    }

    /// Append an item at the next slot, payload filled with a marker byte.
    fn append_item(block: &mut [u8], key: Key, size: u32, marker: u8) {
        let n = header_nritems(block).expect("nritems") as usize;
        let data_end = leaf_data_end(block, BODY).expect("data end");
        let offset = data_end - size as usize;
        set_item_key(block, n, &key).expect("key");
        set_item_offset(block, n, u32::try_from(offset).expect("fits")).expect("offset");
        set_item_size(block, n, size).expect("size");
        block[HEADER_SIZE + offset..HEADER_SIZE + offset + size as usize].fill(marker);
        set_header_nritems(block, u32::try_from(n + 1).expect("fits")).expect("count");
    }

    fn payload(block: &[u8], slot: usize) -> &[u8] {
        let offset = item_offset(block, slot).expect("offset") as usize;
        let size = item_size(block, slot).expect("size") as usize;
        &block[HEADER_SIZE + offset..HEADER_SIZE + offset + size]
    }

    /// Assert the leaf packing invariant: descriptors then free space then
    /// contiguous payload ending at the body end.
    fn assert_packed(block: &[u8]) {
        let n = header_nritems(block).expect("nritems") as usize;
        let mut boundary = BODY;
        for slot in 0..n {
            let offset = item_offset(block, slot).expect("offset") as usize;
            let size = item_size(block, slot).expect("size") as usize;
            assert_eq!(offset + size, boundary, "slot {slot} payload not contiguous");
            boundary = offset;
        }
        assert!(boundary >= n * ITEM_SIZE, "descriptors overrun payload");
    }

    #[test]
    fn free_space_tracks_appends() {
        let mut leaf = empty_leaf();
        assert_eq!(leaf_free_space(&leaf, BODY).expect("free"), BODY);
        append_item(&mut leaf, Key::new(1, 1, 0), 100, 0xAA);
        assert_eq!(
            leaf_free_space(&leaf, BODY).expect("free"),
            BODY - 100 - ITEM_SIZE
        );
        assert_eq!(leaf_space_used(&leaf, 0, 1).expect("used"), 100 + ITEM_SIZE);
    }

    #[test]
    fn push_tail_to_empty_right() {
        let mut left = empty_leaf();
        for i in 0..6_u64 {
            append_item(&mut left, Key::new(1, 1, i), 50 + i as u32, i as u8 + 1);
        }
        let mut right = empty_leaf();

        leaf_push_tail_to_right(&mut left, &mut right, BODY, 3).expect("push");
        assert_eq!(header_nritems(&left).expect("n"), 3);
        assert_eq!(header_nritems(&right).expect("n"), 3);
        assert_packed(&left);
        assert_packed(&right);
        assert_eq!(item_key(&right, 0).expect("key"), Key::new(1, 1, 3));
        assert_eq!(payload(&right, 0), vec![4_u8; 53].as_slice());
        assert_eq!(payload(&right, 2), vec![6_u8; 55].as_slice());
        assert_eq!(payload(&left, 2), vec![3_u8; 52].as_slice());
    }

    #[test]
    fn push_tail_into_occupied_right() {
        let mut left = empty_leaf();
        for i in 0..4_u64 {
            append_item(&mut left, Key::new(1, 1, i), 40, i as u8 + 1);
        }
        let mut right = empty_leaf();
        for i in 10..13_u64 {
            append_item(&mut right, Key::new(1, 1, i), 60, i as u8);
        }

        leaf_push_tail_to_right(&mut left, &mut right, BODY, 2).expect("push");
        assert_eq!(header_nritems(&left).expect("n"), 2);
        assert_eq!(header_nritems(&right).expect("n"), 5);
        assert_packed(&left);
        assert_packed(&right);
        // Moved items precede the originals and keep their payloads.
        assert_eq!(item_key(&right, 0).expect("key"), Key::new(1, 1, 2));
        assert_eq!(item_key(&right, 2).expect("key"), Key::new(1, 1, 10));
        assert_eq!(payload(&right, 0), vec![3_u8; 40].as_slice());
        assert_eq!(payload(&right, 4), vec![12_u8; 60].as_slice());
    }

    #[test]
    fn push_head_to_left() {
        let mut left = empty_leaf();
        for i in 0..2_u64 {
            append_item(&mut left, Key::new(1, 1, i), 30, i as u8 + 1);
        }
        let mut right = empty_leaf();
        for i in 5..9_u64 {
            append_item(&mut right, Key::new(1, 1, i), 70, i as u8);
        }

        leaf_push_head_to_left(&mut left, &mut right, BODY, 2).expect("push");
        assert_eq!(header_nritems(&left).expect("n"), 4);
        assert_eq!(header_nritems(&right).expect("n"), 2);
        assert_packed(&left);
        assert_packed(&right);
        assert_eq!(item_key(&left, 2).expect("key"), Key::new(1, 1, 5));
        assert_eq!(payload(&left, 2), vec![5_u8; 70].as_slice());
        assert_eq!(item_key(&right, 0).expect("key"), Key::new(1, 1, 7));
        assert_eq!(payload(&right, 1), vec![8_u8; 70].as_slice());
    }

    #[test]
    fn push_everything_empties_the_donor() {
        let mut left = empty_leaf();
        append_item(&mut left, Key::new(1, 1, 0), 30, 1);
        let mut right = empty_leaf();
        for i in 5..8_u64 {
            append_item(&mut right, Key::new(1, 1, i), 70, i as u8);
        }

        leaf_push_head_to_left(&mut left, &mut right, BODY, 3).expect("push all");
        assert_eq!(header_nritems(&left).expect("n"), 4);
        assert_eq!(header_nritems(&right).expect("n"), 0);
        assert_packed(&left);
        assert_eq!(leaf_free_space(&right, BODY).expect("free"), BODY);
    }

    #[test]
    fn push_rejects_overfull_receiver() {
        let mut left = empty_leaf();
        append_item(&mut left, Key::new(1, 1, 0), 200, 1);
        let mut right = empty_leaf();
        append_item(&mut right, Key::new(2, 1, 0), u32::try_from(BODY - 2 * ITEM_SIZE - 100).expect("fits"), 2);

        assert!(leaf_push_tail_to_right(&mut left, &mut right, BODY, 1).is_err());
    }

    #[test]
    fn node_pushes_preserve_pointer_order() {
        let mut left = vec![0_u8; 4096];
        set_header_level(&mut left, 1).expect("level");
        for i in 0..5_u64 {
            set_node_key(&mut left, i as usize, &Key::new(i, 1, 0)).expect("key");
            set_node_blockptr(&mut left, i as usize, 0x1000 * (i + 1)).expect("ptr");
        }
        set_header_nritems(&mut left, 5).expect("count");

        let mut right = vec![0_u8; 4096];
        set_header_level(&mut right, 1).expect("level");
        for i in 0..2_u64 {
            set_node_key(&mut right, i as usize, &Key::new(10 + i, 1, 0)).expect("key");
            set_node_blockptr(&mut right, i as usize, 0x9000 + 0x1000 * i).expect("ptr");
        }
        set_header_nritems(&mut right, 2).expect("count");

        node_push_tail_to_right(&mut left, &mut right, 2).expect("push");
        assert_eq!(header_nritems(&left).expect("n"), 3);
        assert_eq!(header_nritems(&right).expect("n"), 4);
        assert_eq!(
            cfs_ondisk::layout::node_key(&right, 0).expect("key"),
            Key::new(3, 1, 0)
        );
        assert_eq!(
            cfs_ondisk::layout::node_blockptr(&right, 1).expect("ptr"),
            0x5000
        );
        assert_eq!(
            cfs_ondisk::layout::node_key(&right, 2).expect("key"),
            Key::new(10, 1, 0)
        );

        node_push_head_to_left(&mut left, &mut right, 1).expect("push back");
        assert_eq!(header_nritems(&left).expect("n"), 4);
        assert_eq!(header_nritems(&right).expect("n"), 3);
        assert_eq!(
            cfs_ondisk::layout::node_key(&left, 3).expect("key"),
            Key::new(3, 1, 0)
        );
    }
}
