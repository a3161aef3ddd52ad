// SPDX-License-Identifier: MPL-2.0

//! Tree node representations.
//!
//! Both node kinds occupy exactly one page so a table page budget counts
//! them uniformly. Leaves hold translation words, directories hold arena
//! handles of their children.

use core::sync::atomic::{AtomicU64, Ordering};

use static_assertions::const_assert_eq;

use super::pte::Pte;
use crate::prelude::*;

/// Translation entries per leaf node.
pub(crate) const NR_LEAF_ENTRIES: usize = 512;
/// Child handles per directory node.
pub(crate) const NR_DIR_ENTRIES: usize = 1024;

/// The absent child handle.
pub(crate) const NO_NODE: u32 = u32::MAX;

/// A last-level node holding translation words.
///
/// Entries are atomic so the refill path can merge state bits while other
/// readers walk the tree.
#[repr(align(4096))]
pub(crate) struct LeafNode {
    entries: [AtomicU64; NR_LEAF_ENTRIES],
}

const_assert_eq!(core::mem::size_of::<LeafNode>(), crate::PAGE_SIZE);

impl LeafNode {
    pub fn new() -> Box<LeafNode> {
        Box::new(LeafNode {
            entries: core::array::from_fn(|_| AtomicU64::new(0)),
        })
    }

    pub fn get(&self, index: usize) -> Pte {
        Pte::from_raw(self.entries[index].load(Ordering::Acquire))
    }

    pub fn set(&self, index: usize, pte: Pte) {
        self.entries[index].store(pte.raw(), Ordering::Release);
    }

    /// Ors `bits` into the entry and returns the merged word.
    pub fn merge(&self, index: usize, bits: u64) -> Pte {
        let old = self.entries[index].fetch_or(bits, Ordering::AcqRel);
        Pte::from_raw(old | bits)
    }
}

/// An inner node holding child handles.
#[repr(align(4096))]
pub(crate) struct DirNode {
    children: [u32; NR_DIR_ENTRIES],
}

const_assert_eq!(core::mem::size_of::<DirNode>(), crate::PAGE_SIZE);

impl DirNode {
    pub fn new() -> Box<DirNode> {
        Box::new(DirNode {
            children: [NO_NODE; NR_DIR_ENTRIES],
        })
    }

    pub fn child(&self, index: usize) -> u32 {
        self.children[index]
    }

    pub fn set_child(&mut self, index: usize, handle: u32) {
        self.children[index] = handle;
    }
}

/// Per-node bookkeeping kept beside the node in its arena slot.
pub(crate) struct SlotMeta {
    /// Handle of the parent directory, [`NO_NODE`] for the root.
    pub parent: u32,
    /// Index of this node within the parent.
    pub parent_index: u16,
    /// Live children (directories) or valid entries (leaves).
    pub holds: u16,
}

/// One arena slot.
pub(crate) enum NodeSlot {
    /// Recyclable slot, threaded on the free list.
    Free { next: u32 },
    Dir { node: Box<DirNode>, meta: SlotMeta },
    Leaf { node: Box<LeafNode>, meta: SlotMeta },
}
