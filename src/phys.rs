// SPDX-License-Identifier: MPL-2.0

//! Physical memory bookkeeping.
//!
//! RAM is described once at boot as a sorted list of extents. Every RAM
//! page gets a dense frame index and a small record: the caching
//! attributes mappings of the page must use, and the dirty bit that
//! modified translations fold into when they are torn down or cleaned.
//! Addresses outside the extents (device registers, ROM) have no record
//! and are never reverse-mapped.

use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use crate::{boot::BootConfig, page_prop::MemAttr, prelude::*};

/// Per-frame state.
pub(crate) struct PageRecord {
    attr: AtomicU8,
    dirty: AtomicBool,
    /// The page's unmanaged mappings are reverse-indexed anyway, for
    /// VA-to-PA lookup on fixed DMA buffers.
    tracked: AtomicBool,
    /// Transient pins taken by lookups that hand the page to a caller.
    holds: AtomicUsize,
}

impl PageRecord {
    fn new() -> Self {
        PageRecord {
            attr: AtomicU8::new(MemAttr::normal().bits()),
            dirty: AtomicBool::new(false),
            tracked: AtomicBool::new(false),
            holds: AtomicUsize::new(0),
        }
    }

    /// The attributes new mappings of this page receive.
    pub fn attr(&self) -> MemAttr {
        MemAttr::from_bits_truncate(self.attr.load(Ordering::Relaxed))
    }

    pub fn set_attr(&self, attr: MemAttr) {
        self.attr.store(attr.bits(), Ordering::Relaxed);
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Relaxed);
    }

    pub fn set_tracked(&self, tracked: bool) {
        self.tracked.store(tracked, Ordering::Relaxed);
    }

    pub fn is_tracked(&self) -> bool {
        self.tracked.load(Ordering::Relaxed)
    }

    pub fn hold(&self) {
        self.holds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unhold(&self) {
        let prev = self.holds.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "unbalanced page hold");
    }

    pub fn hold_count(&self) -> usize {
        self.holds.load(Ordering::Relaxed)
    }
}

/// The extent table, the frame records, and the direct-map geometry.
pub(crate) struct PhysMap {
    extents: Vec<crate::boot::MemExtent>,
    /// Frame index of each extent's first page.
    first_frame: Vec<usize>,
    records: Vec<PageRecord>,
    dmap_base: Vaddr,
}

impl PhysMap {
    pub fn new(config: &BootConfig) -> Self {
        let mut first_frame = Vec::with_capacity(config.extents.len());
        let mut nr_frames = 0;
        for extent in &config.extents {
            first_frame.push(nr_frames);
            nr_frames += extent.len / PAGE_SIZE;
        }
        let mut records = Vec::with_capacity(nr_frames);
        records.resize_with(nr_frames, PageRecord::new);
        PhysMap {
            extents: config.extents.clone(),
            first_frame,
            records,
            dmap_base: config.dmap_base,
        }
    }

    pub fn nr_frames(&self) -> usize {
        self.records.len()
    }

    /// The dense index of the RAM page containing `pa`.
    pub fn frame_index(&self, pa: Paddr) -> Option<usize> {
        let i = self.extents.partition_point(|e| e.end() <= pa);
        let extent = self.extents.get(i)?;
        extent
            .contains(pa)
            .then(|| self.first_frame[i] + (pa - extent.base) / PAGE_SIZE)
    }

    pub fn is_ram(&self, pa: Paddr) -> bool {
        self.frame_index(pa).is_some()
    }

    pub fn record(&self, pa: Paddr) -> Option<&PageRecord> {
        self.frame_index(pa).map(|i| &self.records[i])
    }

    /// Where `pa` appears in the direct map, if it is RAM at all.
    ///
    /// Holes between extents have reserved addresses but no backing
    /// block entry, so they do not count.
    pub fn dmap_va(&self, pa: Paddr) -> Option<Vaddr> {
        self.is_ram(pa).then_some(self.dmap_base + pa)
    }
}
