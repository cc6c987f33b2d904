//! Block checksums.
//!
//! The first 32 bytes of a tree block (and of the superblock) hold the
//! checksum, computed over everything after them. Only crc32c is implemented;
//! the algorithm tag still decodes for the other types so a dump of a foreign
//! image names them instead of printing a raw number. A crc32c digest
//! occupies the first 4 csum bytes little-endian, the rest stay zero.

use cfs_types::{
    ensure_slice, write_fixed, CSUM_TYPE_BLAKE2B, CSUM_TYPE_CRC32C, CSUM_TYPE_SHA256,
    CSUM_TYPE_XXHASH64, ParseError,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Region covered by a checksum: everything after the stored digest.
pub const CSUM_SKIP: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumType {
    Crc32c,
    Xxhash64,
    Sha256,
    Blake2b,
}

impl ChecksumType {
    pub fn from_raw(raw: u16) -> Result<Self, ParseError> {
        match raw {
            CSUM_TYPE_CRC32C => Ok(Self::Crc32c),
            CSUM_TYPE_XXHASH64 => Ok(Self::Xxhash64),
            CSUM_TYPE_SHA256 => Ok(Self::Sha256),
            CSUM_TYPE_BLAKE2B => Ok(Self::Blake2b),
            _ => Err(ParseError::InvalidField {
                field: "csum_type",
                reason: "unknown checksum algorithm tag",
            }),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Crc32c => "crc32c",
            Self::Xxhash64 => "xxhash64",
            Self::Sha256 => "sha256",
            Self::Blake2b => "blake2b",
        }
    }

    /// Whether this tool can compute the digest.
    #[must_use]
    pub fn is_supported(self) -> bool {
        matches!(self, Self::Crc32c)
    }
}

impl fmt::Display for ChecksumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute the crc32c digest of a block, padded to the 32-byte csum field.
pub fn compute_crc32c(block: &[u8]) -> Result<[u8; 32], ParseError> {
    let covered = ensure_slice(block, CSUM_SKIP, block.len().saturating_sub(CSUM_SKIP))?;
    let digest = crc32c::crc32c(covered);
    let mut out = [0_u8; 32];
    out[..4].copy_from_slice(&digest.to_le_bytes());
    Ok(out)
}

/// Recompute and store the checksum in the block's first 32 bytes.
pub fn stamp(block: &mut [u8]) -> Result<(), ParseError> {
    let csum = compute_crc32c(block)?;
    write_fixed::<32>(block, 0, &csum)
}

/// Verify a block's stored checksum. Returns `(stored, computed)` so the
/// caller can build its own mismatch error.
pub fn verify(block: &[u8]) -> Result<(u32, u32), ParseError> {
    let stored = cfs_types::read_le_u32(block, 0)?;
    let computed = crc32c::crc32c(ensure_slice(
        block,
        CSUM_SKIP,
        block.len().saturating_sub(CSUM_SKIP),
    )?);
    Ok((stored, computed))
}
