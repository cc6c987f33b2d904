#![forbid(unsafe_code)]
//! Device I/O and the tree block cache.
//!
//! [`ByteDevice`] is the seam to the underlying image: fixed-offset
//! pread/pwrite semantics, no seek state. [`ExtentBuffer`] is one tree block
//! held in memory behind a shared handle; [`BlockCache`] maps block addresses
//! to handles, bounds residency with LRU eviction, and tracks the dirty set
//! for write-back.
//!
//! The engine built on top is single-threaded (callers serialize mutations
//! per tree); the cache itself is guarded by one mutex so a multi-threaded
//! embedding can at least share read paths safely.

use cfs_error::{Result, TreeError};
use cfs_types::Bytenr;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Byte-addressed device for fixed-offset I/O.
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` at `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// Falls back to read-only when the image cannot be opened writable; writes
/// then fail with an I/O error instead of silently doing nothing.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let len = u64::try_from(buf.len())
            .map_err(|_| TreeError::InvalidArgument("read length overflows u64".to_owned()))?;
        let end = offset
            .checked_add(len)
            .ok_or_else(|| TreeError::InvalidArgument("read range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(TreeError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "read out of bounds: offset={offset} len={} image_len={}",
                    buf.len(),
                    self.len
                ),
            )));
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(TreeError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "image opened read-only",
            )));
        }
        let len = u64::try_from(buf.len())
            .map_err(|_| TreeError::InvalidArgument("write length overflows u64".to_owned()))?;
        let end = offset
            .checked_add(len)
            .ok_or_else(|| TreeError::InvalidArgument("write range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(TreeError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "write out of bounds: offset={offset} len={} image_len={}",
                    buf.len(),
                    self.len
                ),
            )));
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

// ── Extent buffers ──────────────────────────────────────────────────────────

/// One tree block resident in memory.
///
/// Shared via [`BlockHandle`]; the path, the cache, and transient callers all
/// hold the same buffer. Interior lock discipline: take at most one guard per
/// buffer at a time within a call chain (the lock is not reentrant).
#[derive(Debug)]
pub struct ExtentBuffer {
    bytenr: Bytenr,
    data: RwLock<Vec<u8>>,
}

/// Reference-counted handle to an [`ExtentBuffer`].
///
/// Dropping the last handle outside the cache makes the block evictable.
pub type BlockHandle = Arc<ExtentBuffer>;

impl ExtentBuffer {
    #[must_use]
    pub fn new(bytenr: Bytenr, data: Vec<u8>) -> Self {
        Self {
            bytenr,
            data: RwLock::new(data),
        }
    }

    #[must_use]
    pub fn bytenr(&self) -> Bytenr {
        self.bytenr
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write()
    }

    /// Clone the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

// ── Block cache ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct CacheState {
    resident: HashMap<u64, BlockHandle>,
    lru: VecDeque<u64>,
    dirty: HashSet<u64>,
}

/// Bounded cache of tree blocks keyed by logical address.
///
/// Eviction is LRU, oldest first, and only applies to blocks that are clean
/// and unreferenced outside the cache. Dirty blocks stay resident until the
/// owner flushes and clears them.
#[derive(Debug)]
pub struct BlockCache {
    capacity: usize,
    state: Mutex<CacheState>,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(TreeError::InvalidArgument(
                "cache capacity must be > 0".to_owned(),
            ));
        }
        Ok(Self {
            capacity,
            state: Mutex::new(CacheState {
                resident: HashMap::new(),
                lru: VecDeque::new(),
                dirty: HashSet::new(),
            }),
        })
    }

    /// Look up a resident block, refreshing its LRU position.
    #[must_use]
    pub fn get(&self, bytenr: Bytenr) -> Option<BlockHandle> {
        let mut state = self.state.lock();
        let handle = state.resident.get(&bytenr.0).cloned()?;
        touch(&mut state.lru, bytenr.0);
        Some(handle)
    }

    /// Return the cached block, or populate it from `read`.
    ///
    /// `read` performs the device read plus any verification (checksum,
    /// fsid); a block enters the cache only after it passed. Cached hits skip
    /// verification entirely, which is what gives repeated searches their
    /// read-your-writes consistency.
    pub fn get_or_read(
        &self,
        bytenr: Bytenr,
        read: impl FnOnce() -> Result<Vec<u8>>,
    ) -> Result<BlockHandle> {
        if let Some(handle) = self.get(bytenr) {
            return Ok(handle);
        }
        let data = read()?;
        Ok(self.insert(bytenr, data))
    }

    /// Register a freshly created (not yet persisted) block.
    pub fn insert(&self, bytenr: Bytenr, data: Vec<u8>) -> BlockHandle {
        let handle = Arc::new(ExtentBuffer::new(bytenr, data));
        let mut state = self.state.lock();
        state.resident.insert(bytenr.0, handle.clone());
        touch(&mut state.lru, bytenr.0);
        self.evict_locked(&mut state);
        handle
    }

    pub fn mark_dirty(&self, bytenr: Bytenr) {
        self.state.lock().dirty.insert(bytenr.0);
    }

    /// Clear the dirty mark; returns whether the block was dirty.
    pub fn clear_dirty(&self, bytenr: Bytenr) -> bool {
        self.state.lock().dirty.remove(&bytenr.0)
    }

    #[must_use]
    pub fn is_dirty(&self, bytenr: Bytenr) -> bool {
        self.state.lock().dirty.contains(&bytenr.0)
    }

    /// Addresses of all dirty blocks, in ascending order.
    #[must_use]
    pub fn dirty_blocks(&self) -> Vec<Bytenr> {
        let state = self.state.lock();
        let mut blocks: Vec<Bytenr> = state.dirty.iter().copied().map(Bytenr).collect();
        blocks.sort_unstable();
        blocks
    }

    /// Drop a block from the cache regardless of LRU position.
    ///
    /// Outstanding handles stay valid; the block just stops being shared.
    pub fn forget(&self, bytenr: Bytenr) {
        let mut state = self.state.lock();
        state.resident.remove(&bytenr.0);
        state.dirty.remove(&bytenr.0);
        if let Some(pos) = state.lru.iter().position(|b| *b == bytenr.0) {
            state.lru.remove(pos);
        }
    }

    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.state.lock().resident.len()
    }

    fn evict_locked(&self, state: &mut CacheState) {
        while state.resident.len() > self.capacity {
            let Some(pos) = state.lru.iter().position(|bytenr| {
                !state.dirty.contains(bytenr)
                    && state
                        .resident
                        .get(bytenr)
                        .is_some_and(|h| Arc::strong_count(h) == 1)
            }) else {
                // Everything is pinned or dirty; stay over budget.
                return;
            };
            if let Some(victim) = state.lru.remove(pos) {
                state.resident.remove(&victim);
                trace!(bytenr = victim, "block_cache_evict");
            }
        }
    }
}

fn touch(lru: &mut VecDeque<u64>, bytenr: u64) {
    if let Some(pos) = lru.iter().position(|b| *b == bytenr) {
        lru.remove(pos);
    }
    lru.push_back(bytenr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_device_round_trips() {
        let mut tmp = tempfile::NamedTempFile::new().expect("tmpfile");
        tmp.write_all(&[0_u8; 8192]).expect("fill");
        tmp.flush().expect("flush");

        let dev = FileByteDevice::open(tmp.path()).expect("open");
        assert_eq!(dev.len_bytes(), 8192);
        dev.write_all_at(4096, &[7_u8; 16]).expect("write");
        let mut buf = [0_u8; 16];
        dev.read_exact_at(4096, &mut buf).expect("read");
        assert_eq!(buf, [7_u8; 16]);
    }

    #[test]
    fn file_device_rejects_out_of_bounds() {
        let mut tmp = tempfile::NamedTempFile::new().expect("tmpfile");
        tmp.write_all(&[0_u8; 1024]).expect("fill");
        tmp.flush().expect("flush");

        let dev = FileByteDevice::open(tmp.path()).expect("open");
        let mut buf = [0_u8; 64];
        assert!(dev.read_exact_at(1000, &mut buf).is_err());
        assert!(dev.write_all_at(1020, &[0_u8; 8]).is_err());
    }

    #[test]
    fn cache_returns_same_buffer_for_same_address() {
        let cache = BlockCache::new(4).expect("cache");
        let a = cache
            .get_or_read(Bytenr(0x4000), || Ok(vec![1_u8; 64]))
            .expect("read");
        let b = cache
            .get_or_read(Bytenr(0x4000), || panic!("must hit cache"))
            .expect("hit");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn cache_evicts_oldest_clean_unreferenced() {
        let cache = BlockCache::new(2).expect("cache");
        for i in 0..3_u64 {
            let handle = cache.insert(Bytenr(i * 0x1000), vec![0_u8; 16]);
            drop(handle);
        }
        assert_eq!(cache.resident_count(), 2);
        // The first block was the LRU victim.
        assert!(cache.get(Bytenr(0)).is_none());
        assert!(cache.get(Bytenr(0x2000)).is_some());
    }

    #[test]
    fn cache_never_evicts_dirty_or_pinned() {
        let cache = BlockCache::new(1).expect("cache");
        let pinned = cache.insert(Bytenr(0x1000), vec![0_u8; 16]);
        cache.mark_dirty(Bytenr(0x1000));

        let other = cache.insert(Bytenr(0x2000), vec![0_u8; 16]);
        drop(other);
        // Over budget, but 0x1000 is dirty and pinned; both stay resident
        // until the dirty one is flushed and released.
        assert!(cache.get(Bytenr(0x1000)).is_some());
        drop(pinned);

        cache.clear_dirty(Bytenr(0x1000));
        let _third = cache.insert(Bytenr(0x3000), vec![0_u8; 16]);
        assert!(cache.get(Bytenr(0x1000)).is_none());
    }

    #[test]
    fn dirty_set_tracks_marks() {
        let cache = BlockCache::new(8).expect("cache");
        cache.insert(Bytenr(0x1000), vec![0_u8; 16]);
        cache.insert(Bytenr(0x2000), vec![0_u8; 16]);
        cache.mark_dirty(Bytenr(0x2000));
        cache.mark_dirty(Bytenr(0x1000));
        assert_eq!(
            cache.dirty_blocks(),
            vec![Bytenr(0x1000), Bytenr(0x2000)],
            "sorted ascending"
        );
        assert!(cache.clear_dirty(Bytenr(0x1000)));
        assert!(!cache.clear_dirty(Bytenr(0x1000)));
        assert_eq!(cache.dirty_blocks(), vec![Bytenr(0x2000)]);
    }

    #[test]
    fn forget_drops_resident_and_dirty_state() {
        let cache = BlockCache::new(8).expect("cache");
        cache.insert(Bytenr(0x1000), vec![0_u8; 16]);
        cache.mark_dirty(Bytenr(0x1000));
        cache.forget(Bytenr(0x1000));
        assert!(cache.get(Bytenr(0x1000)).is_none());
        assert!(cache.dirty_blocks().is_empty());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(BlockCache::new(0).is_err());
    }
}
