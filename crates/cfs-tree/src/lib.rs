#![forbid(unsafe_code)]
//! Copy-on-write B+tree engine.
//!
//! The engine operates on tree blocks read through a [`TreeSession`]: a
//! device, a bounded block cache, and the image geometry taken from the
//! superblock. All mutation flows through a [`Txn`], which carries the active
//! generation and the collaborator seams ([`BlockAllocator`], [`ExtentRefs`]).
//!
//! Every public operation is synchronous and runs to completion; callers
//! serialize mutating access to a tree. The cache is internally locked so
//! read-only embeddings may share a session across threads.
//!
//! Module map: [`path`] is the cursor, [`search`] the descent, [`cow`] the
//! copy-on-write hook, [`balance`] split/push/merge, [`item`] leaf record
//! mutation, [`node`] the raw byte movers under all of them.

pub mod balance;
pub mod cow;
pub mod item;
pub mod node;
pub mod path;
pub mod search;

pub use balance::PushOutcome;
pub use path::Path;
pub use search::SearchOutcome;

use cfs_block::{BlockCache, BlockHandle, ByteDevice};
use cfs_error::{Result, TreeError};
use cfs_ondisk::csum::{self, ChecksumType};
use cfs_ondisk::sb::{logical_to_image_offset, ChunkEntry, Superblock};
use cfs_ondisk::layout;
use cfs_types::{
    Bytenr, Generation, Key, ParseError, TreeId, HEADER_FLAG_RELOC, HEADER_FLAG_WRITTEN,
};
use tracing::{debug, trace};

/// Convert a layout-level parse failure at the engine boundary.
pub(crate) fn pe(err: ParseError) -> TreeError {
    TreeError::Parse(err.to_string())
}

// ── Collaborator seams ──────────────────────────────────────────────────────

/// Block allocation, provided by the extent-accounting layer.
pub trait BlockAllocator {
    fn alloc_tree_block(
        &mut self,
        nodesize: u32,
        owner: TreeId,
        hint: Bytenr,
        level: u8,
    ) -> Result<Bytenr>;

    fn free_tree_block(
        &mut self,
        bytenr: Bytenr,
        nodesize: u32,
        owner: TreeId,
        level: u8,
    ) -> Result<()>;
}

/// Back-reference maintenance, invoked when copy-on-write replaces a block.
pub trait ExtentRefs {
    fn on_cow(&mut self, _old: Bytenr, _new: Bytenr, _owner: TreeId) -> Result<()> {
        Ok(())
    }
}

/// No-op back-reference tracking for trees that do not carry refs.
#[derive(Debug, Default)]
pub struct NoRefTracking;

impl ExtentRefs for NoRefTracking {}

/// Bump allocator over a contiguous free region of the image.
///
/// Suitable for offline tools building scratch trees; never reuses freed
/// space within a run.
#[derive(Debug)]
pub struct LinearAllocator {
    next: u64,
    limit: u64,
}

impl LinearAllocator {
    #[must_use]
    pub fn new(start: u64, limit: u64) -> Self {
        Self { next: start, limit }
    }

    #[must_use]
    pub fn watermark(&self) -> u64 {
        self.next
    }
}

impl BlockAllocator for LinearAllocator {
    fn alloc_tree_block(
        &mut self,
        nodesize: u32,
        _owner: TreeId,
        _hint: Bytenr,
        _level: u8,
    ) -> Result<Bytenr> {
        let end = self
            .next
            .checked_add(u64::from(nodesize))
            .ok_or(TreeError::NoSpace)?;
        if end > self.limit {
            return Err(TreeError::NoSpace);
        }
        let bytenr = Bytenr(self.next);
        self.next = end;
        Ok(bytenr)
    }

    fn free_tree_block(
        &mut self,
        _bytenr: Bytenr,
        _nodesize: u32,
        _owner: TreeId,
        _level: u8,
    ) -> Result<()> {
        Ok(())
    }
}

/// One mutating transaction: the active generation plus the collaborators
/// every COW and split goes through.
pub struct Txn<'a> {
    pub generation: Generation,
    pub alloc: &'a mut dyn BlockAllocator,
    pub refs: &'a mut dyn ExtentRefs,
}

// ── Tree roots ──────────────────────────────────────────────────────────────

/// Bookkeeping for one tree: the live root plus the commit-root snapshot.
///
/// Copy-on-write moves `bytenr` only; `commit_bytenr` keeps referencing the
/// block graph as of the last commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeRoot {
    pub id: TreeId,
    pub bytenr: Bytenr,
    pub level: u8,
    pub generation: Generation,
    pub commit_bytenr: Bytenr,
    pub commit_level: u8,
    /// System trees that skip back-reference ownership tracking set this
    /// to false.
    pub ref_counted: bool,
}

impl TreeRoot {
    /// Fold the live root into the commit root, as a commit would.
    pub fn advance_commit_root(&mut self) {
        self.commit_bytenr = self.bytenr;
        self.commit_level = self.level;
    }
}

// ── Session ─────────────────────────────────────────────────────────────────

/// Geometry and identity for a [`TreeSession`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub nodesize: u32,
    pub fsid: [u8; 16],
    pub chunk_tree_uuid: [u8; 16],
    /// Bootstrap logical-to-physical mappings. Empty means the image is
    /// flat: logical addresses are byte offsets.
    pub chunks: Vec<ChunkEntry>,
    pub csum_type: ChecksumType,
    pub cache_capacity: usize,
}

/// An open image: device, block cache, and geometry. All tree operations
/// take the session explicitly; there is no global filesystem state.
pub struct TreeSession {
    device: Box<dyn ByteDevice>,
    cache: BlockCache,
    nodesize: u32,
    body_size: usize,
    node_capacity: usize,
    leaf_capacity: usize,
    fsid: [u8; 16],
    chunk_tree_uuid: [u8; 16],
    chunks: Vec<ChunkEntry>,
    csum_type: ChecksumType,
}

impl TreeSession {
    pub fn new(device: Box<dyn ByteDevice>, config: SessionConfig) -> Result<Self> {
        if !config.csum_type.is_supported() {
            return Err(TreeError::Unsupported(format!(
                "checksum algorithm {} is not implemented",
                config.csum_type
            )));
        }
        let body_size = layout::body_size(config.nodesize).map_err(pe)?;
        let node_capacity = layout::node_ptr_capacity(config.nodesize).map_err(pe)?;
        let leaf_capacity = layout::leaf_item_capacity(config.nodesize).map_err(pe)?;
        Ok(Self {
            device,
            cache: BlockCache::new(config.cache_capacity)?,
            nodesize: config.nodesize,
            body_size,
            node_capacity,
            leaf_capacity,
            fsid: config.fsid,
            chunk_tree_uuid: config.chunk_tree_uuid,
            chunks: config.chunks,
            csum_type: config.csum_type,
        })
    }

    /// Open a session from a parsed superblock, bootstrapping the chunk
    /// mappings from its sys-chunk-array.
    pub fn from_superblock(
        device: Box<dyn ByteDevice>,
        sb: &Superblock,
        cache_capacity: usize,
    ) -> Result<Self> {
        let chunks = cfs_ondisk::sb::parse_sys_chunk_array(&sb.sys_chunk_array).map_err(pe)?;
        Self::new(
            device,
            SessionConfig {
                nodesize: sb.nodesize,
                fsid: sb.fsid,
                chunk_tree_uuid: sb.chunk_tree_uuid,
                chunks,
                csum_type: sb.checksum_type().map_err(pe)?,
                cache_capacity,
            },
        )
    }

    #[must_use]
    pub fn nodesize(&self) -> u32 {
        self.nodesize
    }

    #[must_use]
    pub fn body_size(&self) -> usize {
        self.body_size
    }

    #[must_use]
    pub fn node_capacity(&self) -> usize {
        self.node_capacity
    }

    #[must_use]
    pub fn leaf_capacity(&self) -> usize {
        self.leaf_capacity
    }

    #[must_use]
    pub fn fsid(&self) -> [u8; 16] {
        self.fsid
    }

    #[must_use]
    pub fn chunk_tree_uuid(&self) -> [u8; 16] {
        self.chunk_tree_uuid
    }

    /// The checksum algorithm this image was opened with. Always a
    /// supported type; unsupported tags are rejected at session open.
    #[must_use]
    pub fn csum_type(&self) -> ChecksumType {
        self.csum_type
    }

    pub(crate) fn cache(&self) -> &BlockCache {
        &self.cache
    }

    /// Resolve a logical block address to its byte offset in the image.
    pub fn physical_offset(&self, bytenr: Bytenr) -> Result<u64> {
        if self.chunks.is_empty() {
            return Ok(bytenr.0);
        }
        match logical_to_image_offset(&self.chunks, bytenr.0).map_err(pe)? {
            Some(offset) => Ok(u64::try_from(offset)
                .map_err(|_| TreeError::Parse("physical offset overflow".to_owned()))?),
            None => Err(TreeError::InvalidArgument(format!(
                "logical address {bytenr} is not covered by any chunk"
            ))),
        }
    }

    /// Read a tree block, verifying checksum, fsid, and self-address before
    /// it enters the cache. `expected_generation` cross-checks the parent
    /// pointer's recorded generation.
    pub fn read_tree_block(
        &self,
        bytenr: Bytenr,
        expected_generation: Option<Generation>,
    ) -> Result<BlockHandle> {
        let handle = self.cache.get_or_read(bytenr, || {
            let physical = self.physical_offset(bytenr)?;
            let mut data = vec![0_u8; usize::try_from(self.nodesize).map_err(|_| {
                TreeError::Parse("nodesize overflows usize".to_owned())
            })?];
            self.device.read_exact_at(physical, &mut data)?;

            let (stored, computed) = csum::verify(&data).map_err(pe)?;
            if stored != computed {
                return Err(TreeError::ChecksumMismatch {
                    bytenr: bytenr.0,
                    expected: computed,
                    found: stored,
                });
            }
            if layout::header_fsid(&data).map_err(pe)? != self.fsid {
                return Err(TreeError::UuidMismatch { bytenr: bytenr.0 });
            }
            let recorded = layout::header_bytenr(&data).map_err(pe)?;
            if recorded != bytenr.0 {
                return Err(TreeError::Corrupt {
                    bytenr: bytenr.0,
                    kind: cfs_error::CorruptionKind::InvalidOffsets,
                    detail: format!("header records bytenr {recorded}"),
                });
            }
            trace!(bytenr = bytenr.0, "tree_block_read");
            Ok(data)
        })?;

        if let Some(expected) = expected_generation {
            let found = {
                let data = handle.read();
                layout::header_generation(&data).map_err(pe)?
            };
            if found != expected.0 {
                return Err(TreeError::GenerationMismatch {
                    bytenr: bytenr.0,
                    expected: expected.0,
                    found,
                });
            }
        }
        Ok(handle)
    }

    /// Allocate and register a fresh zeroed tree block with an initialized
    /// header, marked dirty.
    pub fn alloc_tree_block(
        &self,
        txn: &mut Txn<'_>,
        owner: TreeId,
        level: u8,
        hint: Bytenr,
    ) -> Result<BlockHandle> {
        let bytenr = txn
            .alloc
            .alloc_tree_block(self.nodesize, owner, hint, level)?;
        let mut data = vec![
            0_u8;
            usize::try_from(self.nodesize)
                .map_err(|_| TreeError::Parse("nodesize overflows usize".to_owned()))?
        ];
        layout::set_header_bytenr(&mut data, bytenr.0).map_err(pe)?;
        layout::set_header_generation(&mut data, txn.generation.0).map_err(pe)?;
        layout::set_header_owner(&mut data, owner.0).map_err(pe)?;
        layout::set_header_level(&mut data, level).map_err(pe)?;
        layout::set_header_fsid(&mut data, &self.fsid).map_err(pe)?;
        layout::set_header_chunk_tree_uuid(&mut data, &self.chunk_tree_uuid).map_err(pe)?;
        let handle = self.cache.insert(bytenr, data);
        self.cache.mark_dirty(bytenr);
        trace!(bytenr = bytenr.0, level, owner = owner.0, "tree_block_alloc");
        Ok(handle)
    }

    /// Create a new empty tree: a single level-0 root block.
    pub fn create_tree(&self, txn: &mut Txn<'_>, id: TreeId) -> Result<TreeRoot> {
        let leaf = self.alloc_tree_block(txn, id, 0, Bytenr(0))?;
        Ok(TreeRoot {
            id,
            bytenr: leaf.bytenr(),
            level: 0,
            generation: txn.generation,
            commit_bytenr: leaf.bytenr(),
            commit_level: 0,
            ref_counted: true,
        })
    }

    pub fn mark_dirty(&self, bytenr: Bytenr) {
        self.cache.mark_dirty(bytenr);
    }

    /// Write every dirty block back to the device: set the written flag,
    /// restamp the checksum, write at the mapped physical offset, sync.
    pub fn flush(&self) -> Result<()> {
        let dirty = self.cache.dirty_blocks();
        debug!(blocks = dirty.len(), "flush_dirty_blocks");
        for bytenr in dirty {
            let Some(handle) = self.cache.get(bytenr) else {
                continue;
            };
            let snapshot = {
                let mut data = handle.write();
                let flags = layout::header_flags(&data).map_err(pe)?;
                layout::set_header_flags(&mut data, flags | HEADER_FLAG_WRITTEN).map_err(pe)?;
                csum::stamp(&mut data).map_err(pe)?;
                data.clone()
            };
            let physical = self.physical_offset(bytenr)?;
            self.device.write_all_at(physical, &snapshot)?;
            self.cache.clear_dirty(bytenr);
        }
        self.device.sync()
    }

    /// Whether a block would have to be copied before mutation in `txn`.
    pub fn block_needs_cow(&self, handle: &BlockHandle, txn: &Txn<'_>) -> Result<bool> {
        let data = handle.read();
        let generation = layout::header_generation(&data).map_err(pe)?;
        let flags = layout::header_flags(&data).map_err(pe)?;
        Ok(generation != txn.generation.0
            || flags & HEADER_FLAG_WRITTEN != 0
            || flags & HEADER_FLAG_RELOC != 0)
    }
}

/// Convenience: full key at the path's current position.
pub fn current_key(path: &Path) -> Result<Key> {
    let leaf = path.leaf()?;
    let data = leaf.read();
    layout::key_at(&data, path.slots[0]).map_err(pe)
}


#[cfg(test)]
mod tests {
    use super::testutil::{make_allocator, make_session};
    use super::*;

    #[test]
    fn create_tree_builds_an_empty_root_leaf() {
        let sess = make_session();
        let mut alloc = make_allocator();
        let mut refs = NoRefTracking;
        let mut txn = Txn {
            generation: Generation(1),
            alloc: &mut alloc,
            refs: &mut refs,
        };

        let root = sess.create_tree(&mut txn, TreeId::FS_TREE).expect("create");
        assert_eq!(root.level, 0);
        assert_eq!(root.commit_bytenr, root.bytenr);

        let block = sess.read_tree_block(root.bytenr, None).expect("read back");
        let data = block.read();
        assert_eq!(layout::header_nritems(&data).expect("nritems"), 0);
        assert_eq!(layout::header_owner(&data).expect("owner"), TreeId::FS_TREE.0);
        assert_eq!(layout::header_generation(&data).expect("gen"), 1);
    }

    #[test]
    fn flush_persists_and_restamps() {
        let sess = make_session();
        let mut alloc = make_allocator();
        let mut refs = NoRefTracking;
        let mut txn = Txn {
            generation: Generation(1),
            alloc: &mut alloc,
            refs: &mut refs,
        };

        let root = sess.create_tree(&mut txn, TreeId::FS_TREE).expect("create");
        sess.flush().expect("flush");

        // Drop the cached copy and force a device read with verification.
        sess.cache().forget(root.bytenr);
        let block = sess.read_tree_block(root.bytenr, None).expect("reread");
        let data = block.read();
        assert_ne!(
            layout::header_flags(&data).expect("flags") & HEADER_FLAG_WRITTEN,
            0
        );
    }

    #[test]
    fn read_rejects_wrong_generation() {
        let sess = make_session();
        let mut alloc = make_allocator();
        let mut refs = NoRefTracking;
        let mut txn = Txn {
            generation: Generation(3),
            alloc: &mut alloc,
            refs: &mut refs,
        };

        let root = sess.create_tree(&mut txn, TreeId::FS_TREE).expect("create");
        let err = sess
            .read_tree_block(root.bytenr, Some(Generation(9)))
            .expect_err("generation mismatch");
        assert!(matches!(err, TreeError::GenerationMismatch { .. }));
    }

    #[test]
    fn read_rejects_corrupted_checksum() {
        let sess = make_session();
        let mut alloc = make_allocator();
        let mut refs = NoRefTracking;
        let mut txn = Txn {
            generation: Generation(1),
            alloc: &mut alloc,
            refs: &mut refs,
        };

        let root = sess.create_tree(&mut txn, TreeId::FS_TREE).expect("create");
        sess.flush().expect("flush");

        // Flip a byte on the device behind the cache's back.
        let physical = sess.physical_offset(root.bytenr).expect("map");
        let mut byte = [0_u8; 1];
        sess.device.read_exact_at(physical + 200, &mut byte).expect("peek");
        byte[0] ^= 0xFF;
        sess.device.write_all_at(physical + 200, &byte).expect("poke");
        sess.cache().forget(root.bytenr);

        let err = sess
            .read_tree_block(root.bytenr, None)
            .expect_err("checksum must fail");
        assert!(matches!(err, TreeError::ChecksumMismatch { .. }));
    }

    #[test]
    fn linear_allocator_respects_its_limit() {
        let mut alloc = LinearAllocator::new(0, 8192);
        let a = alloc
            .alloc_tree_block(4096, TreeId::FS_TREE, Bytenr(0), 0)
            .expect("first");
        let b = alloc
            .alloc_tree_block(4096, TreeId::FS_TREE, Bytenr(0), 0)
            .expect("second");
        assert_ne!(a, b);
        assert!(matches!(
            alloc.alloc_tree_block(4096, TreeId::FS_TREE, Bytenr(0), 0),
            Err(TreeError::NoSpace)
        ));
    }
}
