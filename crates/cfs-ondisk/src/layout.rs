//! Tree block field accessors.
//!
//! A tree block is one `nodesize` buffer: a 101-byte header followed by the
//! body. Leaves (level 0) store item descriptors growing forward from the
//! body start and payload bytes packed backward from the body end; nodes
//! (level > 0) store fixed-size key-pointer slots. All item data offsets are
//! relative to the body start.
//!
//! Every accessor bounds-checks through the `cfs-types` codec helpers and
//! returns `ParseError` on out-of-range access, so a truncated or hostile
//! buffer can never cause a panic.

use cfs_types::{
    read_fixed, read_le_u32, read_le_u64, read_u8, write_fixed, write_le_u32, write_le_u64,
    write_u8, HEADER_SIZE, ITEM_SIZE, KEY_PTR_SIZE, Key, ParseError,
};

const OFF_CSUM: usize = 0x00;
const OFF_FSID: usize = 0x20;
const OFF_BYTENR: usize = 0x30;
const OFF_FLAGS: usize = 0x38;
const OFF_CHUNK_TREE_UUID: usize = 0x40;
const OFF_GENERATION: usize = 0x50;
const OFF_OWNER: usize = 0x58;
const OFF_NRITEMS: usize = 0x60;
const OFF_LEVEL: usize = 0x64;

// ── Geometry ────────────────────────────────────────────────────────────────

/// Usable body bytes of a block of the given size.
pub fn body_size(nodesize: u32) -> Result<usize, ParseError> {
    let nodesize = usize::try_from(nodesize)
        .map_err(|_| ParseError::IntegerConversion { field: "nodesize" })?;
    nodesize
        .checked_sub(HEADER_SIZE)
        .filter(|body| *body >= ITEM_SIZE)
        .ok_or(ParseError::InvalidField {
            field: "nodesize",
            reason: "smaller than the block header",
        })
}

/// Number of key-pointer slots a node can hold.
pub fn node_ptr_capacity(nodesize: u32) -> Result<usize, ParseError> {
    Ok(body_size(nodesize)? / KEY_PTR_SIZE)
}

/// Upper bound on leaf item count (zero-payload items).
pub fn leaf_item_capacity(nodesize: u32) -> Result<usize, ParseError> {
    Ok(body_size(nodesize)? / ITEM_SIZE)
}

// ── Header accessors ────────────────────────────────────────────────────────

pub fn header_csum(block: &[u8]) -> Result<[u8; 32], ParseError> {
    read_fixed::<32>(block, OFF_CSUM)
}

pub fn set_header_csum(block: &mut [u8], csum: &[u8; 32]) -> Result<(), ParseError> {
    write_fixed::<32>(block, OFF_CSUM, csum)
}

pub fn header_fsid(block: &[u8]) -> Result<[u8; 16], ParseError> {
    read_fixed::<16>(block, OFF_FSID)
}

pub fn set_header_fsid(block: &mut [u8], fsid: &[u8; 16]) -> Result<(), ParseError> {
    write_fixed::<16>(block, OFF_FSID, fsid)
}

pub fn header_bytenr(block: &[u8]) -> Result<u64, ParseError> {
    read_le_u64(block, OFF_BYTENR)
}

pub fn set_header_bytenr(block: &mut [u8], bytenr: u64) -> Result<(), ParseError> {
    write_le_u64(block, OFF_BYTENR, bytenr)
}

pub fn header_flags(block: &[u8]) -> Result<u64, ParseError> {
    read_le_u64(block, OFF_FLAGS)
}

pub fn set_header_flags(block: &mut [u8], flags: u64) -> Result<(), ParseError> {
    write_le_u64(block, OFF_FLAGS, flags)
}

pub fn header_chunk_tree_uuid(block: &[u8]) -> Result<[u8; 16], ParseError> {
    read_fixed::<16>(block, OFF_CHUNK_TREE_UUID)
}

pub fn set_header_chunk_tree_uuid(block: &mut [u8], uuid: &[u8; 16]) -> Result<(), ParseError> {
    write_fixed::<16>(block, OFF_CHUNK_TREE_UUID, uuid)
}

pub fn header_generation(block: &[u8]) -> Result<u64, ParseError> {
    read_le_u64(block, OFF_GENERATION)
}

pub fn set_header_generation(block: &mut [u8], generation: u64) -> Result<(), ParseError> {
    write_le_u64(block, OFF_GENERATION, generation)
}

pub fn header_owner(block: &[u8]) -> Result<u64, ParseError> {
    read_le_u64(block, OFF_OWNER)
}

pub fn set_header_owner(block: &mut [u8], owner: u64) -> Result<(), ParseError> {
    write_le_u64(block, OFF_OWNER, owner)
}

pub fn header_nritems(block: &[u8]) -> Result<u32, ParseError> {
    read_le_u32(block, OFF_NRITEMS)
}

pub fn set_header_nritems(block: &mut [u8], nritems: u32) -> Result<(), ParseError> {
    write_le_u32(block, OFF_NRITEMS, nritems)
}

pub fn header_level(block: &[u8]) -> Result<u8, ParseError> {
    read_u8(block, OFF_LEVEL)
}

pub fn set_header_level(block: &mut [u8], level: u8) -> Result<(), ParseError> {
    write_u8(block, OFF_LEVEL, level)
}

// ── Leaf item descriptors ───────────────────────────────────────────────────

fn item_base(slot: usize) -> Result<usize, ParseError> {
    slot.checked_mul(ITEM_SIZE)
        .and_then(|off| off.checked_add(HEADER_SIZE))
        .ok_or(ParseError::InvalidField {
            field: "slot",
            reason: "item offset overflow",
        })
}

pub fn item_key(block: &[u8], slot: usize) -> Result<Key, ParseError> {
    Key::decode(block, item_base(slot)?)
}

pub fn set_item_key(block: &mut [u8], slot: usize, key: &Key) -> Result<(), ParseError> {
    key.encode(block, item_base(slot)?)
}

/// Payload offset of the item at `slot`, relative to the body start.
pub fn item_offset(block: &[u8], slot: usize) -> Result<u32, ParseError> {
    read_le_u32(block, item_base(slot)? + 17)
}

pub fn set_item_offset(block: &mut [u8], slot: usize, offset: u32) -> Result<(), ParseError> {
    write_le_u32(block, item_base(slot)? + 17, offset)
}

pub fn item_size(block: &[u8], slot: usize) -> Result<u32, ParseError> {
    read_le_u32(block, item_base(slot)? + 21)
}

pub fn set_item_size(block: &mut [u8], slot: usize, size: u32) -> Result<(), ParseError> {
    write_le_u32(block, item_base(slot)? + 21, size)
}

// ── Node key-pointer slots ──────────────────────────────────────────────────

fn ptr_base(slot: usize) -> Result<usize, ParseError> {
    slot.checked_mul(KEY_PTR_SIZE)
        .and_then(|off| off.checked_add(HEADER_SIZE))
        .ok_or(ParseError::InvalidField {
            field: "slot",
            reason: "key-pointer offset overflow",
        })
}

pub fn node_key(block: &[u8], slot: usize) -> Result<Key, ParseError> {
    Key::decode(block, ptr_base(slot)?)
}

pub fn set_node_key(block: &mut [u8], slot: usize, key: &Key) -> Result<(), ParseError> {
    key.encode(block, ptr_base(slot)?)
}

pub fn node_blockptr(block: &[u8], slot: usize) -> Result<u64, ParseError> {
    read_le_u64(block, ptr_base(slot)? + 17)
}

pub fn set_node_blockptr(block: &mut [u8], slot: usize, bytenr: u64) -> Result<(), ParseError> {
    write_le_u64(block, ptr_base(slot)? + 17, bytenr)
}

pub fn node_ptr_generation(block: &[u8], slot: usize) -> Result<u64, ParseError> {
    read_le_u64(block, ptr_base(slot)? + 25)
}

pub fn set_node_ptr_generation(
    block: &mut [u8],
    slot: usize,
    generation: u64,
) -> Result<(), ParseError> {
    write_le_u64(block, ptr_base(slot)? + 25, generation)
}

/// First key of a block, leaf or node.
pub fn first_key(block: &[u8]) -> Result<Key, ParseError> {
    if header_level(block)? == 0 {
        item_key(block, 0)
    } else {
        node_key(block, 0)
    }
}

/// Key at `slot` of a block, leaf or node.
pub fn key_at(block: &[u8], slot: usize) -> Result<Key, ParseError> {
    if header_level(block)? == 0 {
        item_key(block, slot)
    } else {
        node_key(block, slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_block(nritems: u32, level: u8) -> Vec<u8> {
        let mut block = vec![0_u8; 4096];
        set_header_nritems(&mut block, nritems).expect("nritems");
        set_header_level(&mut block, level).expect("level");
        block
    }

    #[test]
    fn header_fields_round_trip() {
        let mut block = make_block(3, 1);
        set_header_bytenr(&mut block, 0x40_0000).expect("bytenr");
        set_header_generation(&mut block, 42).expect("gen");
        set_header_owner(&mut block, 5).expect("owner");
        set_header_flags(&mut block, 0b11).expect("flags");
        set_header_fsid(&mut block, &[0xAA; 16]).expect("fsid");

        assert_eq!(header_bytenr(&block).expect("bytenr"), 0x40_0000);
        assert_eq!(header_generation(&block).expect("gen"), 42);
        assert_eq!(header_owner(&block).expect("owner"), 5);
        assert_eq!(header_flags(&block).expect("flags"), 0b11);
        assert_eq!(header_fsid(&block).expect("fsid"), [0xAA; 16]);
        assert_eq!(header_nritems(&block).expect("nritems"), 3);
        assert_eq!(header_level(&block).expect("level"), 1);
    }

    #[test]
    fn item_descriptor_round_trips() {
        let mut block = make_block(1, 0);
        let key = Key::new(256, 168, 0x1000);
        set_item_key(&mut block, 0, &key).expect("key");
        set_item_offset(&mut block, 0, 3900).expect("offset");
        set_item_size(&mut block, 0, 95).expect("size");

        assert_eq!(item_key(&block, 0).expect("key"), key);
        assert_eq!(item_offset(&block, 0).expect("offset"), 3900);
        assert_eq!(item_size(&block, 0).expect("size"), 95);
    }

    #[test]
    fn key_pointer_round_trips() {
        let mut block = make_block(2, 1);
        let key = Key::new(512, 132, 7);
        set_node_key(&mut block, 1, &key).expect("key");
        set_node_blockptr(&mut block, 1, 0x8000).expect("ptr");
        set_node_ptr_generation(&mut block, 1, 9).expect("gen");

        assert_eq!(node_key(&block, 1).expect("key"), key);
        assert_eq!(node_blockptr(&block, 1).expect("ptr"), 0x8000);
        assert_eq!(node_ptr_generation(&block, 1).expect("gen"), 9);
    }

    #[test]
    fn out_of_range_slot_is_an_error() {
        let block = make_block(1, 0);
        // Slot far beyond a 4096-byte block.
        assert!(item_key(&block, 200).is_err());
        assert!(node_blockptr(&block, 200).is_err());
    }

    #[test]
    fn geometry_matches_layout_constants() {
        assert_eq!(body_size(4096).expect("body"), 4096 - HEADER_SIZE);
        assert_eq!(
            node_ptr_capacity(4096).expect("cap"),
            (4096 - HEADER_SIZE) / KEY_PTR_SIZE
        );
        assert_eq!(
            leaf_item_capacity(16384).expect("cap"),
            (16384 - HEADER_SIZE) / ITEM_SIZE
        );
        assert!(body_size(64).is_err(), "nodesize below header size");
    }

    #[test]
    fn first_key_dispatches_on_level() {
        let mut leaf = make_block(1, 0);
        set_item_key(&mut leaf, 0, &Key::new(1, 2, 3)).expect("key");
        assert_eq!(first_key(&leaf).expect("first"), Key::new(1, 2, 3));

        let mut node = make_block(1, 1);
        set_node_key(&mut node, 0, &Key::new(4, 5, 6)).expect("key");
        assert_eq!(first_key(&node).expect("first"), Key::new(4, 5, 6));
    }
}
