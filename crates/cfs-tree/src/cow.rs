//! The copy-on-write hook.
//!
//! A block may be mutated in place only when it was created in the active
//! transaction and has not been written out since. Everything else gets
//! copied: new address, current generation, parent pointer rewired, old
//! block released to the allocator.

use crate::{pe, TreeRoot, TreeSession, Txn};
use cfs_block::BlockHandle;
use cfs_error::Result;
use cfs_ondisk::layout;
use cfs_types::{HEADER_FLAG_RELOC, HEADER_FLAG_WRITTEN};
use tracing::trace;

/// Where the copied block's pointer lives.
pub enum CowParent<'a> {
    /// `block` is the tree's root; the root bookkeeping is rewired.
    Root,
    /// `block` is pointed at by `slot` of this node.
    Node(&'a BlockHandle, usize),
}

/// Copy `block` for mutation if the COW rules require it.
///
/// Returns the handle to mutate, which is `block` itself when it is already
/// writable in this transaction. The path held by the caller keeps the old
/// block alive until the new one is linked in.
pub fn cow_block(
    sess: &TreeSession,
    txn: &mut Txn<'_>,
    root: &mut TreeRoot,
    block: &BlockHandle,
    parent: CowParent<'_>,
) -> Result<BlockHandle> {
    if !sess.block_needs_cow(block, txn)? {
        return Ok(block.clone());
    }

    let old = block.bytenr();
    let (mut data, level) = {
        let guard = block.read();
        (guard.clone(), layout::header_level(&guard).map_err(pe)?)
    };

    let new = sess.alloc_tree_block(txn, root.id, level, old)?;
    let new_bytenr = new.bytenr();
    {
        let mut out = new.write();
        let flags = layout::header_flags(&data).map_err(pe)?
            & !(HEADER_FLAG_WRITTEN | HEADER_FLAG_RELOC);
        layout::set_header_bytenr(&mut data, new_bytenr.0).map_err(pe)?;
        layout::set_header_generation(&mut data, txn.generation.0).map_err(pe)?;
        layout::set_header_owner(&mut data, root.id.0).map_err(pe)?;
        layout::set_header_flags(&mut data, flags).map_err(pe)?;
        layout::set_header_fsid(&mut data, &sess.fsid()).map_err(pe)?;
        layout::set_header_chunk_tree_uuid(&mut data, &sess.chunk_tree_uuid()).map_err(pe)?;
        *out = data;
    }
    sess.mark_dirty(new_bytenr);

    if root.ref_counted {
        txn.refs.on_cow(old, new_bytenr, root.id)?;
    }

    match parent {
        CowParent::Root => {
            root.bytenr = new_bytenr;
            root.generation = txn.generation;
        }
        CowParent::Node(parent_block, slot) => {
            let mut parent_data = parent_block.write();
            layout::set_node_blockptr(&mut parent_data, slot, new_bytenr.0).map_err(pe)?;
            layout::set_node_ptr_generation(&mut parent_data, slot, txn.generation.0)
                .map_err(pe)?;
            drop(parent_data);
            sess.mark_dirty(parent_block.bytenr());
        }
    }

    txn.alloc
        .free_tree_block(old, sess.nodesize(), root.id, level)?;
    trace!(old = old.0, new = new_bytenr.0, level, "cow_block");
    Ok(new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{make_allocator, make_session};
    use crate::NoRefTracking;
    use cfs_types::{Generation, TreeId};

    #[test]
    fn fresh_block_is_not_copied() {
        let sess = make_session();
        let mut alloc = make_allocator();
        let mut refs = NoRefTracking;
        let mut txn = Txn {
            generation: Generation(1),
            alloc: &mut alloc,
            refs: &mut refs,
        };
        let mut root = sess.create_tree(&mut txn, TreeId::FS_TREE).expect("create");

        let block = sess.read_tree_block(root.bytenr, None).expect("read");
        let same = cow_block(&sess, &mut txn, &mut root, &block, CowParent::Root).expect("cow");
        assert_eq!(same.bytenr(), block.bytenr(), "in-place mutation allowed");
    }

    #[test]
    fn persisted_block_is_copied_and_root_rewired() {
        let sess = make_session();
        let mut alloc = make_allocator();
        let mut refs = NoRefTracking;
        let mut txn = Txn {
            generation: Generation(1),
            alloc: &mut alloc,
            refs: &mut refs,
        };
        let mut root = sess.create_tree(&mut txn, TreeId::FS_TREE).expect("create");
        sess.flush().expect("flush");
        let old_bytenr = root.bytenr;

        let mut txn2 = Txn {
            generation: Generation(2),
            alloc: &mut alloc,
            refs: &mut refs,
        };
        let block = sess.read_tree_block(root.bytenr, None).expect("read");
        let copy = cow_block(&sess, &mut txn2, &mut root, &block, CowParent::Root).expect("cow");

        assert_ne!(copy.bytenr(), old_bytenr);
        assert_eq!(root.bytenr, copy.bytenr());
        assert_eq!(root.generation, Generation(2));
        let data = copy.read();
        assert_eq!(layout::header_generation(&data).expect("gen"), 2);
        assert_eq!(
            layout::header_flags(&data).expect("flags") & HEADER_FLAG_WRITTEN,
            0,
            "written flag cleared on the copy"
        );
        assert_eq!(layout::header_bytenr(&data).expect("bytenr"), copy.bytenr().0);
    }

    #[test]
    fn generation_change_forces_copy_even_unwritten() {
        let sess = make_session();
        let mut alloc = make_allocator();
        let mut refs = NoRefTracking;
        let mut txn = Txn {
            generation: Generation(1),
            alloc: &mut alloc,
            refs: &mut refs,
        };
        let mut root = sess.create_tree(&mut txn, TreeId::FS_TREE).expect("create");

        // No flush: block is dirty but belongs to generation 1.
        let mut txn2 = Txn {
            generation: Generation(2),
            alloc: &mut alloc,
            refs: &mut refs,
        };
        let block = sess.read_tree_block(root.bytenr, None).expect("read");
        assert!(sess.block_needs_cow(&block, &txn2).expect("needs cow"));
        let copy = cow_block(&sess, &mut txn2, &mut root, &block, CowParent::Root).expect("cow");
        assert_ne!(copy.bytenr(), block.bytenr());
    }
}
