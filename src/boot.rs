// SPDX-License-Identifier: MPL-2.0

//! Boot-time configuration handed in by the platform layer.
//!
//! The embedder discovers physical memory and decides the kernel virtual
//! layout (by firmware tables, device tree, or linker constants) before this
//! crate runs; [`BootConfig`] is the record of those decisions. It is
//! validated once by [`Mmu::bootstrap`] and never changes afterwards.
//!
//! [`Mmu::bootstrap`]: crate::mmu::Mmu::bootstrap

use core::ops::Range;

use crate::{
    error::Error,
    page_table::{self, PagingScheme},
    prelude::*,
};

/// One contiguous region of installed RAM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemExtent {
    /// First physical address of the region.
    pub base: Paddr,
    /// Length in bytes.
    pub len: usize,
}

impl MemExtent {
    /// The first physical address past the region.
    pub const fn end(&self) -> Paddr {
        self.base + self.len
    }

    /// Returns whether the physical address falls inside the region.
    pub const fn contains(&self, pa: Paddr) -> bool {
        pa >= self.base && pa < self.end()
    }
}

/// Everything the platform layer must decide before translation management
/// can start.
///
/// All addresses are page-aligned. The virtual windows partition the kernel
/// half of the address space: the kernel window is backed by the
/// (preallocated) kernel page-table tree, the device window and the direct
/// map are backed by TLB1 entries only.
#[derive(Clone, Debug)]
pub struct BootConfig {
    /// Number of CPUs that will ever run.
    pub nr_cpus: usize,
    /// Exclusive upper bound of hardware context ids. Id 0 is the reserved
    /// privileged wildcard, so at least 2 are required.
    pub tid_limit: u16,
    /// Number of TLB1 slots implemented by the hardware (at most 64).
    pub tlb1_slots: usize,
    /// Installed RAM, sorted by base address, non-overlapping.
    pub extents: Vec<MemExtent>,
    /// Base of the kernel page-table window; also the user/kernel boundary.
    pub kernel_base: Vaddr,
    /// Virtual span of the kernel image, covered by protected TLB1 slot 0.
    pub kernel_image: Range<Vaddr>,
    /// Physical address the kernel image was loaded at.
    pub kernel_load_pa: Paddr,
    /// Kernel virtual addresses served by `kenter`/`qenter`/`map`.
    pub kernel_window: Range<Vaddr>,
    /// Sub-range of the kernel window reserved for crash-dump mappings.
    pub dump_window: Range<Vaddr>,
    /// Virtual addresses the device-mapping carve-out allocator hands out.
    pub device_window: Range<Vaddr>,
    /// Base of the direct map; physical address `pa` appears at
    /// `dmap_base + pa`.
    pub dmap_base: Vaddr,
    /// Optional global budget of page-table node pages.
    pub table_page_limit: Option<usize>,
    /// Optional hard cap on pooled reverse-map entries.
    pub pv_entry_limit: Option<usize>,
    /// Reverse-map pool size that signals memory pressure when crossed.
    pub pv_high_water: usize,
}

impl BootConfig {
    /// The number of bytes of the direct map, `[dmap_base, dmap_base+len)`.
    ///
    /// The map is identity-offset, so holes between extents stay reserved
    /// but unmapped.
    pub fn dmap_len(&self) -> usize {
        self.extents.last().map_or(0, |e| e.end())
    }

    /// The virtual range occupied by the direct map.
    pub fn dmap_range(&self) -> Range<Vaddr> {
        self.dmap_base..self.dmap_base + self.dmap_len()
    }

    /// Checks internal consistency against the paging scheme `S`.
    ///
    /// Returns [`Error::InvalidArgs`] naming nothing; the log carries the
    /// reason at debug level.
    pub fn validate<S: PagingScheme>(&self) -> Result<()> {
        let span = page_table::span::<S>();

        if self.nr_cpus == 0 || self.tid_limit < 2 {
            return fail("cpu count or tid limit");
        }
        if self.tlb1_slots == 0 || self.tlb1_slots > 64 {
            return fail("tlb1 slot count");
        }
        if self.pv_high_water == 0 {
            return fail("pv high water");
        }

        if self.extents.is_empty() {
            return fail("no memory extents");
        }
        let mut prev_end = 0;
        for e in &self.extents {
            if e.len == 0
                || !crate::is_page_aligned(e.base)
                || !crate::is_page_aligned(e.len)
                || e.base.checked_add(e.len).is_none()
                || e.base < prev_end
            {
                return fail("memory extent table");
            }
            prev_end = e.end();
        }

        for w in [
            &self.kernel_image,
            &self.kernel_window,
            &self.dump_window,
            &self.device_window,
        ] {
            if w.start >= w.end
                || !crate::is_page_aligned(w.start)
                || !crate::is_page_aligned(w.end)
            {
                return fail("window alignment");
            }
        }

        // The user half is [0, span); everything the kernel owns sits above.
        // The tree base must be span-aligned so leaf boundaries fall at the
        // same addresses in the virtual and the offset space. On 32-bit the
        // kernel half ends exactly at the top of the address space, so the
        // bounds are compared as offsets to avoid the wrapping sum.
        if self.kernel_base < span || self.kernel_base % span != 0 {
            return fail("kernel base");
        }
        if self.kernel_window.start < self.kernel_base
            || self.kernel_window.end - self.kernel_base > span
        {
            return fail("kernel window outside tree span");
        }
        if self.dump_window.start < self.kernel_window.start
            || self.dump_window.end > self.kernel_window.end
        {
            return fail("dump window outside kernel window");
        }
        if self.device_window.start < span {
            return fail("device window below kernel boundary");
        }

        if !crate::is_page_aligned(self.dmap_base) || self.dmap_base < span {
            return fail("dmap base");
        }
        if self.dmap_base.checked_add(self.dmap_len()).is_none() {
            return fail("dmap overflow");
        }

        let dmap = self.dmap_range();
        if overlap(&self.kernel_window, &self.device_window)
            || overlap(&self.kernel_window, &dmap)
            || overlap(&self.device_window, &dmap)
            || overlap(&self.kernel_image, &self.kernel_window)
            || overlap(&self.kernel_image, &self.device_window)
            || overlap(&self.kernel_image, &dmap)
        {
            return fail("window overlap");
        }

        // Slot 0 must be able to cover the image with one power-of-four
        // sized, naturally aligned entry.
        let image_len = self.kernel_image.end - self.kernel_image.start;
        let Some(slot_size) = crate::tlb1::entry_size_covering(image_len) else {
            return fail("kernel image size");
        };
        if self.kernel_image.start % slot_size != 0 || self.kernel_load_pa % slot_size != 0 {
            return fail("kernel image alignment");
        }

        Ok(())
    }

    /// The number of table pages the kernel tree needs up front.
    pub(crate) fn kernel_table_pages<S: PagingScheme>(&self) -> usize {
        page_table::pages_to_cover::<S>(self.kernel_base, &self.kernel_window)
    }
}

fn fail(what: &str) -> Result<()> {
    log::debug!("[boot] rejecting configuration: {}", what);
    Err(Error::InvalidArgs)
}

fn overlap(a: &Range<Vaddr>, b: &Range<Vaddr>) -> bool {
    a.start < b.end && b.start < a.end
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::page_table::Booke64;

    pub(crate) fn config_for_test() -> BootConfig {
        let gib = 1 << 30;
        BootConfig {
            nr_cpus: 2,
            tid_limit: 8,
            tlb1_slots: 16,
            extents: alloc::vec![
                MemExtent { base: 0, len: 64 << 20 },
                MemExtent { base: gib, len: 16 << 20 },
            ],
            kernel_base: 1 << 41,
            kernel_image: (1 << 41)..(1 << 41) + (4 << 20),
            kernel_load_pa: 0,
            kernel_window: (1 << 41) + (64 << 20)..(1 << 41) + (96 << 20),
            dump_window: (1 << 41) + (95 << 20)..(1 << 41) + (96 << 20),
            device_window: (3 << 41)..(3 << 41) + (1 << 40),
            dmap_base: 2 << 41,
            table_page_limit: None,
            pv_entry_limit: None,
            pv_high_water: 1024,
        }
    }

    #[test]
    fn accepts_sane_config() {
        assert!(config_for_test().validate::<Booke64>().is_ok());
    }

    #[test]
    fn rejects_overlapping_windows() {
        let mut c = config_for_test();
        c.device_window = c.dmap_base..c.dmap_base + (1 << 30);
        assert!(c.validate::<Booke64>().is_err());
    }

    #[test]
    fn rejects_unsorted_extents() {
        let mut c = config_for_test();
        c.extents.swap(0, 1);
        assert!(c.validate::<Booke64>().is_err());
    }

    #[test]
    fn rejects_low_kernel_base() {
        let mut c = config_for_test();
        c.kernel_base = 1 << 30;
        assert!(c.validate::<Booke64>().is_err());
    }
}
