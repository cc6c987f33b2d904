//! The tree cursor.
//!
//! A [`Path`] records one walk from root to leaf: a block handle plus slot
//! index per level. Handles pin blocks in the cache, so a positioned path
//! guarantees every block along the walk stays resident until release.

use cfs_block::BlockHandle;
use cfs_error::{Result, TreeError};
use cfs_types::MAX_LEVEL;

/// Readahead hint recorded on the path for sequential scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadaDirection {
    #[default]
    None,
    Forward,
    Back,
}

/// Cursor over one tree: block references and slots from the root down.
///
/// `nodes[0]` is the leaf; `nodes[root_level]` is the root. Levels above the
/// root stay `None`.
#[derive(Default)]
pub struct Path {
    pub nodes: [Option<BlockHandle>; MAX_LEVEL],
    pub slots: [usize; MAX_LEVEL],
    /// Stop descending at this level instead of the leaf. Used by repair
    /// operations that shift whole subtrees.
    pub lowest_level: u8,
    /// Skip per-block structural validation (trusted rebuild paths only).
    pub skip_check: bool,
    /// The search is preparing a split; leaf splitting is suppressed.
    pub search_for_split: bool,
    pub reada: ReadaDirection,
}

impl Path {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all block references, returning the path to unpositioned.
    pub fn release(&mut self) {
        for node in &mut self.nodes {
            *node = None;
        }
        self.slots = [0; MAX_LEVEL];
    }

    /// Drop references at and below `level` (exclusive of levels above).
    pub fn release_below(&mut self, level: usize) {
        for l in 0..=level.min(MAX_LEVEL - 1) {
            self.nodes[l] = None;
            self.slots[l] = 0;
        }
    }

    /// The leaf block, if the path is positioned at one.
    pub fn leaf(&self) -> Result<&BlockHandle> {
        self.nodes[0].as_ref().ok_or(TreeError::NotPositioned)
    }

    /// Block at `level`.
    pub fn node_at(&self, level: usize) -> Result<&BlockHandle> {
        self.nodes
            .get(level)
            .and_then(Option::as_ref)
            .ok_or(TreeError::NotPositioned)
    }

    /// Highest level currently held.
    #[must_use]
    pub fn top_level(&self) -> Option<usize> {
        (0..MAX_LEVEL).rev().find(|l| self.nodes[*l].is_some())
    }

    #[must_use]
    pub fn is_positioned(&self) -> bool {
        self.nodes[usize::from(self.lowest_level)].is_some()
    }
}

impl std::fmt::Debug for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut levels = f.debug_list();
        for level in (0..MAX_LEVEL).rev() {
            if let Some(node) = &self.nodes[level] {
                levels.entry(&format_args!(
                    "L{} {}[{}]",
                    level,
                    node.bytenr(),
                    self.slots[level]
                ));
            }
        }
        levels.finish()
    }
}
