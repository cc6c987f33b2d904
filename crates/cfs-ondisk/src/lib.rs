#![forbid(unsafe_code)]
//! On-disk format for CowFS images.
//!
//! Three concerns live here, all pure byte manipulation:
//!
//! - [`layout`]: field accessors for tree block headers, leaf item
//!   descriptors, and node key-pointer slots, reading and writing raw
//!   buffers through explicit offset arithmetic (structures are never
//!   aliased over untrusted bytes).
//! - [`sb`]: superblock parse/encode and the sys-chunk-array bootstrap
//!   mapping from logical to physical addresses.
//! - [`csum`]: block checksum algorithms (crc32c implemented; the other
//!   tags are recognized and reported as unsupported).

pub mod csum;
pub mod layout;
pub mod sb;

pub use csum::ChecksumType;
pub use sb::{ChunkEntry, PhysicalMapping, Stripe, Superblock};
