#![forbid(unsafe_code)]
//! Shared types for CowFS: the tree key, unit-carrying newtypes, on-disk
//! layout constants, and little-endian byte codec helpers.
//!
//! Everything here is pure: no I/O, no global state. Parsing failures are
//! reported through [`ParseError`] and converted to richer error types at
//! crate boundaries.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Byte offset of the primary superblock within an image.
pub const SUPER_INFO_OFFSET: usize = 64 * 1024;
/// Size of the superblock region.
pub const SUPER_INFO_SIZE: usize = 4096;
/// On-disk magic ("_BHRfS_M" little-endian).
pub const SUPER_MAGIC: u64 = 0x4D5F_5366_5248_425F;

/// Maximum tree height. Levels are 0 (leaf) through `MAX_LEVEL - 1`.
pub const MAX_LEVEL: usize = 8;

/// Size of the tree block header (csum 32 + fsid 16 + bytenr 8 + flags 8 +
/// chunk-tree uuid 16 + generation 8 + owner 8 + nritems 4 + level 1).
pub const HEADER_SIZE: usize = 101;
/// Size of an encoded key (objectid 8 + type 1 + offset 8).
pub const DISK_KEY_SIZE: usize = 17;
/// Size of a leaf item descriptor (key 17 + data offset 4 + data size 4).
pub const ITEM_SIZE: usize = 25;
/// Size of a node key-pointer slot (key 17 + blockptr 8 + generation 8).
pub const KEY_PTR_SIZE: usize = 33;

/// Header flag: block has been written to disk in its current generation.
pub const HEADER_FLAG_WRITTEN: u64 = 1 << 0;
/// Header flag: block belongs to an in-progress relocation.
pub const HEADER_FLAG_RELOC: u64 = 1 << 1;
/// Top 8 bits of the header flags word carry the backref revision tag.
pub const BACKREF_REV_SHIFT: u64 = 56;

/// Checksum algorithm tags stored in the superblock `csum_type` field.
pub const CSUM_TYPE_CRC32C: u16 = 0;
pub const CSUM_TYPE_XXHASH64: u16 = 1;
pub const CSUM_TYPE_SHA256: u16 = 2;
pub const CSUM_TYPE_BLAKE2B: u16 = 3;

// ── Item type tags ──────────────────────────────────────────────────────────

pub const INODE_ITEM_KEY: u8 = 1;
pub const DIR_ITEM_KEY: u8 = 84;
pub const EXTENT_DATA_KEY: u8 = 108;
pub const ROOT_ITEM_KEY: u8 = 132;
pub const EXTENT_ITEM_KEY: u8 = 168;
pub const METADATA_ITEM_KEY: u8 = 169;
pub const CHUNK_ITEM_KEY: u8 = 228;

/// Offset of the inline payload within a file extent item. The fixed
/// sub-structure before it (generation, ram bytes, compression, encryption,
/// other encoding, type) must be preserved field-wise when an inline extent
/// is truncated from the front.
pub const FILE_EXTENT_INLINE_DATA_START: usize = 21;

// ── Newtypes ────────────────────────────────────────────────────────────────

/// Logical byte address of a tree block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Bytenr(pub u64);

/// Identifier of one tree (the `owner` field of its blocks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TreeId(pub u64);

/// Commit epoch counter. A block whose generation equals the active
/// transaction's generation was created in that transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(pub u64);

impl TreeId {
    pub const ROOT_TREE: Self = Self(1);
    pub const EXTENT_TREE: Self = Self(2);
    pub const CHUNK_TREE: Self = Self(3);
    pub const FS_TREE: Self = Self(5);
}

impl Bytenr {
    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

/// Tree item key: `(objectid, type, offset)`.
///
/// The derived ordering is the on-disk ordering: objectid first, then the
/// type tag, then offset, all unsigned. Keys are globally comparable; each
/// tree is an independent namespace rooted at its own block.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Key {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

impl Key {
    #[must_use]
    pub const fn new(objectid: u64, item_type: u8, offset: u64) -> Self {
        Self {
            objectid,
            item_type,
            offset,
        }
    }

    pub const MIN: Self = Self::new(0, 0, 0);
    pub const MAX: Self = Self::new(u64::MAX, u8::MAX, u64::MAX);

    /// Decode a key from its 17-byte on-disk form.
    pub fn decode(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            objectid: read_le_u64(data, offset)?,
            item_type: read_u8(data, offset + 8)?,
            offset: read_le_u64(data, offset + 9)?,
        })
    }

    /// Encode into the 17-byte on-disk form at `offset`.
    pub fn encode(&self, data: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_le_u64(data, offset, self.objectid)?;
        write_u8(data, offset + 8, self.item_type)?;
        write_le_u64(data, offset + 9, self.offset)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {} {})", self.objectid, self.item_type, self.offset)
    }
}

impl fmt::Display for Bytenr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Parse errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Byte codec helpers ──────────────────────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(
    data: &mut [u8],
    offset: usize,
    len: usize,
) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_u8(data: &mut [u8], offset: usize, value: u8) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 1)?[0] = value;
    Ok(())
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_fixed<const N: usize>(
    data: &mut [u8],
    offset: usize,
    value: &[u8; N],
) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, N)?.copy_from_slice(value);
    Ok(())
}

/// Trim NUL padding from a fixed-size label field.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Narrow a `u32` to `usize` with an explicit error path.
pub fn u32_to_usize(value: u32, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_order_is_objectid_type_offset() {
        let a = Key::new(1, 200, 500);
        let b = Key::new(2, 0, 0);
        assert!(a < b, "objectid dominates");

        let c = Key::new(2, 1, u64::MAX);
        let d = Key::new(2, 2, 0);
        assert!(c < d, "type breaks objectid ties");

        let e = Key::new(2, 2, 1);
        assert!(d < e, "offset breaks type ties");
    }

    #[test]
    fn key_round_trips_through_disk_form() {
        let key = Key::new(0xDEAD_BEEF, 168, 0x1_0000);
        let mut buf = [0_u8; DISK_KEY_SIZE];
        key.encode(&mut buf, 0).expect("encode");
        assert_eq!(Key::decode(&buf, 0).expect("decode"), key);
    }

    #[test]
    fn key_decode_rejects_short_buffer() {
        let buf = [0_u8; 10];
        assert!(matches!(
            Key::decode(&buf, 0),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn read_write_helpers_round_trip() {
        let mut buf = [0_u8; 16];
        write_le_u16(&mut buf, 0, 0x1234).expect("u16");
        write_le_u32(&mut buf, 2, 0x5678_9ABC).expect("u32");
        write_le_u64(&mut buf, 6, 0xDEAD_BEEF_CAFE_F00D).expect("u64");
        assert_eq!(read_le_u16(&buf, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&buf, 2).expect("u32"), 0x5678_9ABC);
        assert_eq!(read_le_u64(&buf, 6).expect("u64"), 0xDEAD_BEEF_CAFE_F00D);
    }

    #[test]
    fn write_out_of_bounds_is_an_error() {
        let mut buf = [0_u8; 4];
        assert!(write_le_u64(&mut buf, 0, 1).is_err());
        assert!(write_le_u32(&mut buf, 2, 1).is_err());
    }

    #[test]
    fn slot_sizes_are_consistent() {
        assert_eq!(DISK_KEY_SIZE + 4 + 4, ITEM_SIZE);
        assert_eq!(DISK_KEY_SIZE + 8 + 8, KEY_PTR_SIZE);
    }

    #[test]
    fn trim_nul_padded_strips_padding() {
        assert_eq!(trim_nul_padded(b"cowfs\0\0\0"), "cowfs");
        assert_eq!(trim_nul_padded(b""), "");
    }
}
