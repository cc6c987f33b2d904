#![forbid(unsafe_code)]
//! Error types for CowFS.
//!
//! # Error taxonomy
//!
//! | Class | Variant(s) | Recovery policy |
//! |-------|------------|-----------------|
//! | I/O failure | `Io` | propagated, never retried inside the engine |
//! | Structural corruption | `Corrupt` + [`CorruptionKind`] | propagated with the failed invariant so callers can triage |
//! | Identity mismatch | `ChecksumMismatch`, `UuidMismatch`, `GenerationMismatch` | treated as corruption, distinct from plain I/O |
//! | Resource exhaustion | `NoSpace` | caller decides (abort or free space) |
//! | Precondition violation | `NotPositioned`, `InvalidArgument`, `Exists`, `NotFound` | bug or misuse at the call site, always recoverable |
//! | Unsupported format | `Unsupported` | image is valid but outside this build's envelope |
//!
//! The engine never recovers from corruption internally: inspection tools
//! log-and-continue, repair tools reconstruct, everything else aborts. Every
//! condition that would be a fatal assertion in a kernel implementation is a
//! typed `Err` here.
//!
//! This crate is intentionally independent of `cfs-types`; parse errors are
//! converted at the consuming crate's boundary (see `cfs-tree`).

use thiserror::Error;

/// The specific structural invariant a corrupt block violated.
///
/// Each condition is distinct so a repair tool can choose a strategy per
/// kind rather than pattern-matching on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionKind {
    /// Item/pointer count is zero (outside the root) or exceeds capacity.
    InvalidNritems,
    /// Keys are not strictly increasing across consecutive slots.
    BadKeyOrder,
    /// A child's first key does not match its parent slot's stored key.
    InvalidParentKey,
    /// Leaf item payload ranges overlap, leave gaps, or exceed the body.
    InvalidOffsets,
    /// Header level is wrong for the block's position in the tree.
    InvalidLevel,
    /// Leaf descriptors overrun the payload region.
    InvalidFreeSpace,
}

impl CorruptionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidNritems => "INVALID_NRITEMS",
            Self::BadKeyOrder => "BAD_KEY_ORDER",
            Self::InvalidParentKey => "INVALID_PARENT_KEY",
            Self::InvalidOffsets => "INVALID_OFFSETS",
            Self::InvalidLevel => "INVALID_LEVEL",
            Self::InvalidFreeSpace => "INVALID_FREE_SPACE",
        }
    }
}

impl std::fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for all CowFS tree operations.
#[derive(Debug, Error)]
pub enum TreeError {
    /// Operating system I/O error (short read/write, device error).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A tree block violated a structural invariant.
    #[error("corrupt block at {bytenr}: {kind}: {detail}")]
    Corrupt {
        bytenr: u64,
        kind: CorruptionKind,
        detail: String,
    },

    /// Stored checksum does not match the block contents.
    #[error("checksum mismatch at {bytenr}: expected {expected:#010x}, found {found:#010x}")]
    ChecksumMismatch {
        bytenr: u64,
        expected: u32,
        found: u32,
    },

    /// Block carries a filesystem UUID from a different filesystem.
    #[error("fsid mismatch at {bytenr}")]
    UuidMismatch { bytenr: u64 },

    /// Block generation differs from the parent pointer's recorded one.
    #[error("generation mismatch at {bytenr}: expected {expected}, found {found}")]
    GenerationMismatch {
        bytenr: u64,
        expected: u64,
        found: u64,
    },

    /// Superblock or other metadata failed to parse.
    #[error("parse error: {0}")]
    Parse(String),

    /// The block allocator has no space left.
    #[error("no space left for tree blocks")]
    NoSpace,

    /// A cursor operation was requested on an unpositioned path.
    #[error("path is not positioned at an item")]
    NotPositioned,

    /// Caller-supplied arguments are inconsistent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Insert of a key that already exists.
    #[error("key exists: {0}")]
    Exists(String),

    /// Lookup of a key that does not exist where one was required.
    #[error("not found: {0}")]
    NotFound(String),

    /// The image uses an on-disk feature this build does not support.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Result alias using `TreeError`.
pub type Result<T> = std::result::Result<T, TreeError>;
