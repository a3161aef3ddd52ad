// SPDX-License-Identifier: MPL-2.0

//! Software translation trees.
//!
//! The hardware walks nothing on a Book-E part; these trees exist so the
//! miss handler and the pager can find translations in bounded time. A tree
//! covers one naturally aligned span of the address space. User spaces get
//! one tree at base zero, the kernel gets one at the configured kernel base,
//! and both are built from page-sized nodes held in a per-tree arena and
//! addressed by `u32` handles.
//!
//! Node pages are accounted against a global [`PtBudget`] shared by every
//! tree, so a runaway user space cannot starve the kernel window of table
//! pages.

use core::{marker::PhantomData, ops::Range};

use crate::{error::Error, prelude::*};

pub(crate) mod node;
pub(crate) mod pte;

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use node::{DirNode, LeafNode, NodeSlot, SlotMeta, NO_NODE, NR_DIR_ENTRIES, NR_LEAF_ENTRIES};
use pte::{Pte, PteFlags};

/// The number of offset bits resolved by a leaf node.
const LEAF_INDEX_BITS: usize = 9;
/// The number of offset bits resolved by a directory node.
const DIR_INDEX_BITS: usize = 10;

/// The span of virtual addresses one leaf node covers.
pub(crate) const LEAF_SPAN: usize = 1 << (PAGE_SHIFT + LEAF_INDEX_BITS);

/// The shape of a translation tree.
///
/// Implementors are markers; the depth decides how much address space one
/// tree spans.
pub trait PagingScheme: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Total number of tree levels, counting the leaf level.
    const NR_LEVELS: u8;
}

/// The two-level shape of the 32-bit parts.
///
/// Its 2 GiB tree span equals one half of the address space, so one tree
/// serves a user space and one serves the kernel.
#[derive(Clone, Copy, Debug, Default)]
pub struct Booke32;

impl PagingScheme for Booke32 {
    const NR_LEVELS: u8 = 2;
}

/// The three-level shape of the 64-bit parts, spanning 2 TiB per tree.
#[derive(Clone, Copy, Debug, Default)]
pub struct Booke64;

impl PagingScheme for Booke64 {
    const NR_LEVELS: u8 = 3;
}

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        /// The scheme matching the build target's pointer width.
        pub type NativeScheme = Booke64;
    } else {
        /// The scheme matching the build target's pointer width.
        pub type NativeScheme = Booke32;
    }
}

/// The number of bytes of virtual address space one tree covers.
pub const fn span<S: PagingScheme>() -> usize {
    1 << (PAGE_SHIFT + LEAF_INDEX_BITS + DIR_INDEX_BITS * (S::NR_LEVELS as usize - 1))
}

/// The number of node pages needed to cover `window` in a tree at `base`,
/// not counting the root.
pub(crate) fn pages_to_cover<S: PagingScheme>(base: Vaddr, window: &Range<Vaddr>) -> usize {
    let mut total = 0;
    let mut unit = LEAF_SPAN;
    for _ in 1..S::NR_LEVELS {
        let first = (window.start - base) / unit;
        let last = (window.end - base).div_ceil(unit);
        total += last - first;
        unit <<= DIR_INDEX_BITS;
    }
    total
}

/// The end of the leaf-node window containing `va`, clamped at the top of
/// the address space.
pub(crate) fn leaf_window_end(va: Vaddr) -> Vaddr {
    (va & !(LEAF_SPAN - 1))
        .checked_add(LEAF_SPAN)
        .unwrap_or(Vaddr::MAX)
}

fn leaf_index(off: usize) -> usize {
    (off >> PAGE_SHIFT) & (NR_LEAF_ENTRIES - 1)
}

fn dir_index(off: usize, level: u8) -> usize {
    let shift = PAGE_SHIFT + LEAF_INDEX_BITS + DIR_INDEX_BITS * (level as usize - 2);
    (off >> shift) & (NR_DIR_ENTRIES - 1)
}

/// The span covered by one child slot of a directory at `level`.
fn child_span(level: u8) -> usize {
    LEAF_SPAN << (DIR_INDEX_BITS * (level as usize - 2))
}

/// Global accounting of table node pages.
///
/// `reserve` never blocks; a caller that may wait reads the generation,
/// drops its locks, and parks in [`PtBudget::wait_until_freed`] until some
/// tree returns pages.
pub(crate) struct PtBudget {
    limit: Option<usize>,
    in_use: AtomicUsize,
    generation: AtomicU64,
}

impl PtBudget {
    pub fn new(limit: Option<usize>) -> Self {
        PtBudget {
            limit,
            in_use: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
        }
    }

    pub fn reserve(&self, pages: usize) -> Result<()> {
        let Some(limit) = self.limit else {
            self.in_use.fetch_add(pages, Ordering::Relaxed);
            return Ok(());
        };
        let mut cur = self.in_use.load(Ordering::Relaxed);
        loop {
            let next = cur + pages;
            if next > limit {
                return Err(Error::NoMemory);
            }
            match self.in_use.compare_exchange_weak(
                cur,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn release(&self, pages: usize) {
        self.in_use.fetch_sub(pages, Ordering::Relaxed);
        self.generation.fetch_add(1, Ordering::Release);
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Spins until pages were returned after `seen` or headroom exists.
    ///
    /// Must be called with no locks held.
    pub fn wait_until_freed(&self, seen: u64) {
        loop {
            if self.generation.load(Ordering::Acquire) != seen {
                return;
            }
            match self.limit {
                Some(limit) if self.in_use.load(Ordering::Relaxed) >= limit => {}
                _ => return,
            }
            core::hint::spin_loop();
        }
    }
}

/// One translation tree covering `[base, base + span)`.
///
/// All mutation happens under the owning address space's lock; entry words
/// are atomic only so state-bit merges stay racefree against readers.
pub(crate) struct PtTree<S: PagingScheme> {
    base: Vaddr,
    arena: Vec<NodeSlot>,
    free_head: u32,
    root: u32,
    nr_nodes: usize,
    /// Permanent trees never return node pages, even when leaves empty out.
    permanent: bool,
    budget: Arc<PtBudget>,
    _scheme: PhantomData<S>,
}

impl<S: PagingScheme> PtTree<S> {
    pub fn new(base: Vaddr, permanent: bool, budget: Arc<PtBudget>) -> Result<Self> {
        debug_assert_eq!(base % span::<S>(), 0);
        budget.reserve(1)?;
        let root = NodeSlot::Dir {
            node: DirNode::new(),
            meta: SlotMeta {
                parent: NO_NODE,
                parent_index: 0,
                holds: 0,
            },
        };
        Ok(PtTree {
            base,
            arena: alloc::vec![root],
            free_head: NO_NODE,
            root: 0,
            nr_nodes: 1,
            permanent,
            budget,
            _scheme: PhantomData,
        })
    }

    pub fn base(&self) -> Vaddr {
        self.base
    }

    pub fn contains(&self, va: Vaddr) -> bool {
        va >= self.base && va - self.base < span::<S>()
    }

    /// Node pages the tree currently holds, the root included.
    pub fn nr_nodes(&self) -> usize {
        self.nr_nodes
    }

    fn offset(&self, va: Vaddr) -> usize {
        debug_assert!(self.contains(va));
        va - self.base
    }

    /// Returns the valid entry translating `va`, if any.
    pub fn lookup(&self, va: Vaddr) -> Option<Pte> {
        let off = self.offset(va);
        let leaf = self.walk(off)?;
        let pte = self.leaf_node(leaf).get(leaf_index(off));
        pte.is_valid().then_some(pte)
    }

    /// Inserts a fresh entry, growing the path as needed.
    ///
    /// Finding a valid entry already in place is a bookkeeping corruption
    /// and panics. Node pages beyond the budget make this fail with
    /// [`Error::NoMemory`] and leave the tree unchanged.
    pub fn install(&mut self, va: Vaddr, pte: Pte) -> Result<()> {
        debug_assert!(pte.is_valid());
        let off = self.offset(va);
        let missing = self.path_missing(off);
        if missing > 0 {
            self.budget.reserve(missing)?;
        }
        let leaf = self.descend_create(off);
        let index = leaf_index(off);
        let (node, meta) = self.leaf_mut(leaf);
        if node.get(index).is_valid() {
            panic!("translation already present at {va:#x}");
        }
        node.set(index, pte);
        meta.holds += 1;
        Ok(())
    }

    /// Overwrites the valid entry at `va`, returning the old word.
    pub fn replace(&mut self, va: Vaddr, pte: Pte) -> Pte {
        debug_assert!(pte.is_valid());
        let off = self.offset(va);
        let Some(leaf) = self.walk(off) else {
            panic!("no translation to replace at {va:#x}");
        };
        let index = leaf_index(off);
        let (node, _) = self.leaf_mut(leaf);
        let old = node.get(index);
        assert!(old.is_valid(), "no translation to replace at {va:#x}");
        node.set(index, pte);
        old
    }

    /// Removes the entry at `va` and returns it, reclaiming emptied nodes.
    pub fn clear(&mut self, va: Vaddr) -> Option<Pte> {
        let off = self.offset(va);
        let leaf = self.walk(off)?;
        let index = leaf_index(off);
        let (node, meta) = self.leaf_mut(leaf);
        let old = node.get(index);
        if !old.is_valid() {
            return None;
        }
        node.set(index, Pte::EMPTY);
        meta.holds -= 1;
        if meta.holds == 0 && !self.permanent {
            self.release_upward(leaf);
        }
        Some(old)
    }

    /// Ors the given state bits into the valid entry at `va`.
    pub fn merge_flags(&self, va: Vaddr, flags: PteFlags) -> Option<Pte> {
        let off = self.offset(va);
        let leaf = self.walk(off)?;
        let index = leaf_index(off);
        let node = self.leaf_node(leaf);
        if !node.get(index).is_valid() {
            return None;
        }
        Some(node.merge(index, flags.bits()))
    }

    /// The lowest address at or above `va` whose leaf node exists.
    ///
    /// Entries within the returned leaf still need a per-page [`lookup`];
    /// the scan only skips whole absent subtrees.
    ///
    /// [`lookup`]: Self::lookup
    pub fn next_present(&self, va: Vaddr) -> Option<Vaddr> {
        let mut off = self.offset(va);
        let end = span::<S>();
        'restart: while off < end {
            let mut node = self.root;
            let mut level = S::NR_LEVELS;
            while level >= 2 {
                let child = self.dir(node).child(dir_index(off, level));
                if child == NO_NODE {
                    let unit = child_span(level);
                    off = (off / unit + 1) * unit;
                    continue 'restart;
                }
                node = child;
                level -= 1;
            }
            return Some(self.base + off);
        }
        None
    }

    /// Builds every node needed to map `range`, without writing entries.
    ///
    /// Each leaf window's missing path is counted right before it is
    /// built, so a directory shared by several windows is reserved once.
    /// On budget exhaustion the nodes built so far stay in place.
    pub fn ensure_covered(&mut self, range: &Range<Vaddr>) -> Result<()> {
        let start = self.offset(range.start) & !(LEAF_SPAN - 1);
        let end = (self.offset(range.end - 1) & !(LEAF_SPAN - 1)) + LEAF_SPAN;
        let mut off = start;
        while off < end {
            let missing = self.path_missing(off);
            if missing > 0 {
                self.budget.reserve(missing)?;
            }
            self.descend_create(off);
            off += LEAF_SPAN;
        }
        Ok(())
    }

    fn walk(&self, off: usize) -> Option<u32> {
        let mut node = self.root;
        for level in (2..=S::NR_LEVELS).rev() {
            let child = self.dir(node).child(dir_index(off, level));
            if child == NO_NODE {
                return None;
            }
            node = child;
        }
        Some(node)
    }

    /// Counts the nodes absent on the path to the leaf covering `off`.
    fn path_missing(&self, off: usize) -> usize {
        let mut node = self.root;
        for level in (2..=S::NR_LEVELS).rev() {
            let child = self.dir(node).child(dir_index(off, level));
            if child == NO_NODE {
                return level as usize - 1;
            }
            node = child;
        }
        0
    }

    /// Walks to the leaf covering `off`, creating missing nodes.
    ///
    /// The caller has already reserved budget for them.
    fn descend_create(&mut self, off: usize) -> u32 {
        let mut node = self.root;
        for level in (2..=S::NR_LEVELS).rev() {
            let index = dir_index(off, level);
            let child = self.dir(node).child(index);
            if child != NO_NODE {
                node = child;
                continue;
            }
            let meta = SlotMeta {
                parent: node,
                parent_index: index as u16,
                holds: 0,
            };
            let slot = if level == 2 {
                NodeSlot::Leaf {
                    node: LeafNode::new(),
                    meta,
                }
            } else {
                NodeSlot::Dir {
                    node: DirNode::new(),
                    meta,
                }
            };
            let handle = self.alloc_slot(slot);
            self.dir_mut(node).set_child(index, handle);
            self.meta_mut(node).holds += 1;
            node = handle;
        }
        node
    }

    /// Frees `handle` and every ancestor that empties out, the root
    /// excepted.
    fn release_upward(&mut self, mut handle: u32) {
        loop {
            let (parent, parent_index) = {
                let meta = self.meta(handle);
                (meta.parent, meta.parent_index)
            };
            self.free_slot(handle);
            debug_assert_ne!(parent, NO_NODE);
            self.dir_mut(parent).set_child(parent_index as usize, NO_NODE);
            let meta = self.meta_mut(parent);
            meta.holds -= 1;
            if meta.holds != 0 || parent == self.root {
                return;
            }
            handle = parent;
        }
    }

    fn alloc_slot(&mut self, slot: NodeSlot) -> u32 {
        self.nr_nodes += 1;
        if self.free_head != NO_NODE {
            let handle = self.free_head;
            let old = core::mem::replace(&mut self.arena[handle as usize], slot);
            let NodeSlot::Free { next } = old else {
                panic!("free list corrupted");
            };
            self.free_head = next;
            handle
        } else {
            let handle = self.arena.len() as u32;
            self.arena.push(slot);
            handle
        }
    }

    fn free_slot(&mut self, handle: u32) {
        self.arena[handle as usize] = NodeSlot::Free {
            next: self.free_head,
        };
        self.free_head = handle;
        self.nr_nodes -= 1;
        self.budget.release(1);
    }

    fn dir(&self, handle: u32) -> &DirNode {
        match &self.arena[handle as usize] {
            NodeSlot::Dir { node, .. } => node,
            _ => panic!("expected a directory node"),
        }
    }

    fn dir_mut(&mut self, handle: u32) -> &mut DirNode {
        match &mut self.arena[handle as usize] {
            NodeSlot::Dir { node, .. } => node,
            _ => panic!("expected a directory node"),
        }
    }

    fn leaf_node(&self, handle: u32) -> &LeafNode {
        match &self.arena[handle as usize] {
            NodeSlot::Leaf { node, .. } => node,
            _ => panic!("expected a leaf node"),
        }
    }

    fn leaf_mut(&mut self, handle: u32) -> (&LeafNode, &mut SlotMeta) {
        match &mut self.arena[handle as usize] {
            NodeSlot::Leaf { node, meta } => (node, meta),
            _ => panic!("expected a leaf node"),
        }
    }

    fn meta(&self, handle: u32) -> &SlotMeta {
        match &self.arena[handle as usize] {
            NodeSlot::Dir { meta, .. } | NodeSlot::Leaf { meta, .. } => meta,
            NodeSlot::Free { .. } => panic!("free slot has no metadata"),
        }
    }

    fn meta_mut(&mut self, handle: u32) -> &mut SlotMeta {
        match &mut self.arena[handle as usize] {
            NodeSlot::Dir { meta, .. } | NodeSlot::Leaf { meta, .. } => meta,
            NodeSlot::Free { .. } => panic!("free slot has no metadata"),
        }
    }
}

impl<S: PagingScheme> Drop for PtTree<S> {
    fn drop(&mut self) {
        self.budget.release(self.nr_nodes);
    }
}
