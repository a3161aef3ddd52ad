// SPDX-License-Identifier: MPL-2.0

//! The explicitly programmed block-translation array.
//!
//! TLB1 holds a few dozen variable-size entries that the hardware never
//! replaces on its own. The kernel image, the direct physical map, and
//! device windows live here, leaving TLB0 entirely to the page-backed
//! 4 KiB world. Sizes are powers of four from 4 KiB to 4 GiB and every
//! entry is naturally aligned in both address spaces, which is what the
//! region decomposition below is for.
//!
//! There is no hardware broadcast for TLB1, so the manager reprograms
//! slots on every CPU through a stop-the-world rendezvous and keeps a
//! logical copy that is, by construction, what each CPU's array contains.
//! CPUs brought up later receive the array as a [`Tlb1Image`] snapshot.

use core::ops::Range;

use align_ext::AlignExt;
use smallvec::SmallVec;
use spin::Mutex;

use crate::{
    boot::BootConfig,
    error::Error,
    machine::Machine,
    page_prop::{Access, MemAttr},
    prelude::*,
};

/// The smallest programmable entry size.
pub const MIN_ENTRY_SIZE: usize = PAGE_SIZE;

const MAX_ENTRY_SHIFT: u32 = 32;

/// Returns whether `size` is programmable as a single entry: a power of
/// four between 4 KiB and 4 GiB.
pub fn is_entry_size(size: usize) -> bool {
    size.is_power_of_two()
        && size.trailing_zeros() >= PAGE_SHIFT as u32
        && size.trailing_zeros() % 2 == 0
        && size.trailing_zeros() <= MAX_ENTRY_SHIFT
}

/// The smallest single-entry size covering `len`, if one exists.
pub(crate) fn entry_size_covering(len: usize) -> Option<usize> {
    let size = len.max(MIN_ENTRY_SIZE).checked_next_power_of_two()?;
    if is_entry_size(size) {
        Some(size)
    } else {
        let size = size.checked_mul(2)?;
        is_entry_size(size).then_some(size)
    }
}

/// One slot's programming, as the hardware sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tlb1Entry {
    /// First virtual address covered.
    pub va: Vaddr,
    /// First physical address covered.
    pub pa: Paddr,
    /// Bytes covered; a power of four, both addresses aligned to it.
    pub size: usize,
    /// Memory attributes of the whole block.
    pub attr: MemAttr,
    /// Supervisor permissions of the whole block.
    pub access: Access,
    /// Exempt from any invalidate-all operation the hardware offers.
    pub protected: bool,
    /// Whether the slot translates at all.
    pub valid: bool,
}

impl Tlb1Entry {
    /// The cleared slot.
    pub const INVALID: Tlb1Entry = Tlb1Entry {
        va: 0,
        pa: 0,
        size: 0,
        attr: MemAttr::empty(),
        access: Access::empty(),
        protected: false,
        valid: false,
    };

    /// The virtual range the entry covers.
    pub fn range(&self) -> Range<Vaddr> {
        self.va..self.va + self.size
    }

    /// Returns whether the entry translates `va`.
    pub fn covers(&self, va: Vaddr) -> bool {
        self.valid && va >= self.va && va - self.va < self.size
    }

    fn covers_phys(&self, pa: Paddr, len: usize) -> bool {
        self.valid && pa >= self.pa && pa + len <= self.pa + self.size
    }
}

/// A snapshot of the slot array, used to replicate it onto a CPU that was
/// not running when the entries were programmed.
pub struct Tlb1Image {
    entries: Vec<(usize, Tlb1Entry)>,
}

impl Tlb1Image {
    /// Programs the snapshot into the calling CPU's array.
    pub(crate) fn install(&self, machine: &dyn Machine) {
        for &(slot, entry) in &self.entries {
            machine.tlb1_write(slot, entry);
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SlotKind {
    /// The wired kernel image entry in slot 0.
    Image,
    /// Direct-map coverage of one RAM chunk.
    DirectMap,
    /// A device mapping handed out by [`Tlb1::map_device`].
    Device,
}

#[derive(Clone, Copy)]
struct Slot {
    entry: Tlb1Entry,
    kind: SlotKind,
}

struct Tlb1Inner {
    slots: Vec<Option<Slot>>,
    device_window: Range<Vaddr>,
    device_cursor: Vaddr,
}

impl Tlb1Inner {
    fn first_free(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }

    fn nr_free(&self) -> usize {
        self.slots.iter().filter(|s| s.is_none()).count()
    }

    fn used(&self) -> impl Iterator<Item = (usize, &Slot)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s)))
    }

    /// An existing block translating all of `[pa, pa + len)` with the
    /// wanted attributes.
    fn find_covering(&self, pa: Paddr, len: usize, attr: MemAttr) -> Option<Vaddr> {
        self.used()
            .map(|(_, s)| s.entry)
            .find(|e| e.attr == attr && e.covers_phys(pa, len))
            .map(|e| e.va + (pa - e.pa))
    }
}

/// The cross-CPU manager of the block-translation array.
///
/// Its lock is self-contained: it is never taken while an address-space
/// lock is held, and the rendezvous it runs never requires target CPUs to
/// take it.
pub(crate) struct Tlb1 {
    inner: Mutex<Tlb1Inner>,
}

impl Tlb1 {
    pub fn new(config: &BootConfig) -> Self {
        Tlb1 {
            inner: Mutex::new(Tlb1Inner {
                slots: alloc::vec![None; config.tlb1_slots],
                device_window: config.device_window.clone(),
                device_cursor: config.device_window.start,
            }),
        }
    }

    /// Programs the boot CPU's array: the protected kernel-image entry in
    /// slot 0, then direct-map coverage of every RAM extent.
    ///
    /// Runs before other CPUs exist, so the writes are local.
    pub fn bootstrap(&self, machine: &dyn Machine, config: &BootConfig) -> Result<()> {
        let mut inner = self.inner.lock();

        let image_len = config.kernel_image.end - config.kernel_image.start;
        let Some(image_size) = entry_size_covering(image_len) else {
            return Err(Error::InvalidArgs);
        };
        let image = Tlb1Entry {
            va: config.kernel_image.start,
            pa: config.kernel_load_pa,
            size: image_size,
            attr: MemAttr::normal(),
            access: Access::all(),
            protected: true,
            valid: true,
        };

        let mut pending: SmallVec<[Tlb1Chunk; 8]> = SmallVec::new();
        for extent in &config.extents {
            let va = config.dmap_base + extent.base;
            pending.extend(decompose(va, extent.base, extent.len));
        }
        if pending.len() + 1 > inner.slots.len() {
            log::debug!(
                "[tlb1] direct map needs {} entries, only {} slots",
                pending.len(),
                inner.slots.len() - 1
            );
            return Err(Error::NotEnoughResources);
        }

        inner.slots[0] = Some(Slot {
            entry: image,
            kind: SlotKind::Image,
        });
        machine.tlb1_write(0, image);

        for chunk in pending {
            let entry = Tlb1Entry {
                va: chunk.va,
                pa: chunk.pa,
                size: chunk.size,
                attr: MemAttr::normal(),
                access: Access::all(),
                protected: false,
                valid: true,
            };
            let slot = inner.first_free().ok_or(Error::NotEnoughResources)?;
            inner.slots[slot] = Some(Slot {
                entry,
                kind: SlotKind::DirectMap,
            });
            machine.tlb1_write(slot, entry);
            log::debug!(
                "[tlb1] slot {} maps {:#x} bytes of ram at {:#x}",
                slot,
                chunk.size,
                chunk.va
            );
        }
        Ok(())
    }

    /// Snapshots the array for replication onto a later CPU.
    pub fn snapshot(&self) -> Tlb1Image {
        let inner = self.inner.lock();
        let entries = inner.used().map(|(i, s)| (i, s.entry)).collect();
        Tlb1Image { entries }
    }

    /// Maps `[pa, pa + len)` uncached-or-otherwise into the device window
    /// and returns the chosen virtual address.
    ///
    /// An existing block already translating the range with the same
    /// attributes is reused without spending slots. A small request whose
    /// physical base allows it is widened to one covering block rather
    /// than decomposed into a run of minimal entries.
    pub fn map_device(
        &self,
        machine: &dyn Machine,
        pa: Paddr,
        len: usize,
        attr: MemAttr,
    ) -> Result<Vaddr> {
        if len == 0 || !attr.is_valid() {
            return Err(Error::InvalidArgs);
        }
        let offset = pa & (PAGE_SIZE - 1);
        let pa = pa - offset;
        let len = (len + offset).align_up(PAGE_SIZE);
        if pa.checked_add(len).is_none() {
            return Err(Error::InvalidArgs);
        }

        let mut inner = self.inner.lock();
        if let Some(va) = inner.find_covering(pa, len, attr) {
            return Ok(va + offset);
        }

        // A lone covering block beats a run of small chunks when the
        // physical base lines up and the slack past the end stays under
        // the requested length itself. The window is reserved for this
        // allocator, so the extra coverage costs nothing but the bytes.
        let len = match entry_size_covering(len) {
            Some(size) if pa % size == 0 && size - len <= len => size,
            _ => len,
        };

        // Aligning the window cut to the covering power of two keeps the
        // decomposition as coarse as the physical alignment allows.
        let align = len.checked_next_power_of_two().ok_or(Error::InvalidArgs)?;
        let va = inner.device_cursor.align_up(align);
        match va.checked_add(len) {
            Some(end) if end <= inner.device_window.end => (),
            _ => return Err(Error::NoMemory),
        }

        let chunks = decompose(va, pa, len);
        let mut free = inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i);
        let mut programmed: SmallVec<[(usize, Tlb1Entry); 8]> = SmallVec::new();
        for chunk in &chunks {
            let Some(slot) = free.next() else {
                log::debug!(
                    "[tlb1] device mapping of {:#x} bytes needs {} free slots",
                    len,
                    chunks.len()
                );
                return Err(Error::NotEnoughResources);
            };
            let entry = Tlb1Entry {
                va: chunk.va,
                pa: chunk.pa,
                size: chunk.size,
                attr,
                access: Access::RW,
                protected: false,
                valid: true,
            };
            programmed.push((slot, entry));
        }
        drop(free);

        inner.device_cursor = va + len;
        for &(slot, entry) in &programmed {
            inner.slots[slot] = Some(Slot {
                entry,
                kind: SlotKind::Device,
            });
        }
        write_everywhere(machine, &programmed);
        log::debug!(
            "[tlb1] mapped {:#x} bytes of device space at {:#x} in {} slots",
            len,
            va,
            programmed.len()
        );
        Ok(va + offset)
    }

    /// Releases the device entries lying entirely inside `[va, va + len)`.
    ///
    /// The range is widened the same way [`Tlb1::map_device`] widens small
    /// requests, so releasing a mapping with its original length drops the
    /// covering block. Blocks shared with a wider mapping stay; image and
    /// direct-map entries are never touched.
    pub fn unmap_device(&self, machine: &dyn Machine, va: Vaddr, len: usize) -> Result<()> {
        let offset = va & (PAGE_SIZE - 1);
        let va = va - offset;
        let len = (len + offset).align_up(PAGE_SIZE);
        let len = match entry_size_covering(len) {
            Some(size) if va % size == 0 && size - len <= len => size,
            _ => len,
        };

        let mut inner = self.inner.lock();
        let window = inner.device_window.clone();
        let Some(end) = va.checked_add(len) else {
            return Err(Error::InvalidArgs);
        };
        if va < window.start || end > window.end {
            return Err(Error::InvalidArgs);
        }

        let mut dropped: SmallVec<[(usize, Tlb1Entry); 8]> = SmallVec::new();
        for i in 0..inner.slots.len() {
            let Some(slot) = inner.slots[i] else { continue };
            if slot.kind != SlotKind::Device {
                continue;
            }
            let r = slot.entry.range();
            if r.start >= va && r.end <= end {
                inner.slots[i] = None;
                dropped.push((i, Tlb1Entry::INVALID));
            }
        }
        if !dropped.is_empty() {
            write_everywhere(machine, &dropped);
        }
        Ok(())
    }

    /// Rewrites the attributes of the blocks covering parts of
    /// `[va, va + len)`.
    ///
    /// Returns `Ok(false)` when no block overlaps the range at all, so the
    /// caller can fall back to page translations. A block straddling the
    /// range boundary cannot be split and fails the call.
    pub fn change_attr(
        &self,
        machine: &dyn Machine,
        va: Vaddr,
        len: usize,
        attr: MemAttr,
    ) -> Result<bool> {
        let Some(end) = va.checked_add(len) else {
            return Err(Error::InvalidArgs);
        };
        let mut inner = self.inner.lock();

        let mut touched: SmallVec<[usize; 8]> = SmallVec::new();
        for (i, slot) in inner.used() {
            let r = slot.entry.range();
            if r.end <= va || r.start >= end {
                continue;
            }
            if r.start < va || r.end > end {
                return Err(Error::InvalidArgs);
            }
            touched.push(i);
        }
        if touched.is_empty() {
            return Ok(false);
        }

        let mut rewritten: SmallVec<[(usize, Tlb1Entry); 8]> = SmallVec::new();
        for &i in &touched {
            let Some(slot) = inner.slots[i].as_mut() else {
                continue;
            };
            slot.entry.attr = attr;
            rewritten.push((i, slot.entry));
        }
        write_everywhere(machine, &rewritten);
        Ok(true)
    }

    /// The physical address and attributes `va` translates to, if a block
    /// covers it.
    pub fn lookup(&self, va: Vaddr) -> Option<(Paddr, MemAttr)> {
        let inner = self.inner.lock();
        let found = inner.used().map(|(_, s)| s.entry).find(|e| e.covers(va));
        found.map(|e| (e.pa + (va - e.va), e.attr))
    }

    /// Returns whether `[pa, pa + len)` is already reachable through an
    /// uncached or guarded block, meaning device registers there need no
    /// fresh mapping.
    pub fn covers_io(&self, pa: Paddr, len: usize) -> bool {
        let inner = self.inner.lock();
        let covered = inner.used().any(|(_, s)| {
            s.entry
                .attr
                .intersects(MemAttr::CACHE_INHIBIT | MemAttr::GUARDED)
                && s.entry.covers_phys(pa, len)
        });
        covered
    }

    /// Logs every live slot at debug level.
    pub fn log_slots(&self) {
        let inner = self.inner.lock();
        log::debug!("[tlb1] {} of {} slots free", inner.nr_free(), inner.slots.len());
        for (i, slot) in inner.used() {
            let e = slot.entry;
            log::debug!(
                "[tlb1] slot {:2}: va {:#x} pa {:#x} size {:#x} {:?} {:?}{}",
                i,
                e.va,
                e.pa,
                e.size,
                e.attr,
                slot.kind,
                if e.protected { " protected" } else { "" },
            );
        }
    }

    #[cfg(test)]
    pub fn nr_free(&self) -> usize {
        self.inner.lock().nr_free()
    }
}

/// Programs the given slots identically on every CPU.
fn write_everywhere(machine: &dyn Machine, entries: &[(usize, Tlb1Entry)]) {
    for &(_, entry) in entries {
        debug_assert!(!entry.valid || is_entry_size(entry.size));
        debug_assert!(!entry.valid || entry.va % entry.size == 0);
        debug_assert!(!entry.valid || entry.pa % entry.size == 0);
    }
    machine.broadcast(&|| {
        for &(slot, entry) in entries {
            machine.tlb1_write(slot, entry);
        }
    });
}

pub(crate) struct Tlb1Chunk {
    pub va: Vaddr,
    pub pa: Paddr,
    pub size: usize,
}

/// Cuts a region into naturally aligned power-of-four blocks, largest
/// first.
pub(crate) fn decompose(mut va: Vaddr, mut pa: Paddr, mut len: usize) -> SmallVec<[Tlb1Chunk; 8]> {
    debug_assert!(crate::is_page_aligned(va));
    debug_assert!(crate::is_page_aligned(pa));
    debug_assert!(crate::is_page_aligned(len));
    let mut chunks = SmallVec::new();
    while len > 0 {
        let shift = (len.ilog2() & !1).min(MAX_ENTRY_SHIFT);
        let mut size = 1usize << shift;
        while size > MIN_ENTRY_SIZE && (va | pa) & (size - 1) != 0 {
            size >>= 2;
        }
        chunks.push(Tlb1Chunk { va, pa, size });
        va += size;
        pa += size;
        len -= size;
    }
    chunks
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{boot::test::config_for_test, cpu::CpuId, soft::SoftMachine};

    const MIB: usize = 1 << 20;

    fn sizes(chunks: &[Tlb1Chunk]) -> Vec<usize> {
        chunks.iter().map(|c| c.size).collect()
    }

    #[test]
    fn entry_sizes_are_powers_of_four() {
        assert!(is_entry_size(4 << 10));
        assert!(is_entry_size(16 << 10));
        assert!(is_entry_size(256 * MIB));
        assert!(is_entry_size(1 << 30));
        assert!(!is_entry_size(8 << 10));
        assert!(!is_entry_size(2 * MIB));
        assert!(!is_entry_size(0));
        assert!(!is_entry_size(1 << 11));
        assert_eq!(entry_size_covering(3 * MIB), Some(4 * MIB));
        assert_eq!(entry_size_covering(5 * MIB), Some(16 * MIB));
        assert_eq!(entry_size_covering(100), Some(4 << 10));
    }

    #[test]
    fn decomposition_is_greedy() {
        let chunks = decompose(0x2000_0000, 0x1000_0000, 300 * MIB);
        assert_eq!(
            sizes(&chunks),
            [256 * MIB, 16 * MIB, 16 * MIB, 4 * MIB, 4 * MIB, 4 * MIB]
        );
        // Alignment of the addresses caps the first block.
        let chunks = decompose(0x40_0000, 0x40_0000, 64 * MIB);
        assert_eq!(sizes(&chunks)[0], 4 * MIB);
        // Each block is naturally aligned at both addresses.
        for c in decompose(0x2000_0000, 0x123_4000, 12 * MIB + 0x5000) {
            assert_eq!(c.va % c.size, 0);
            assert_eq!(c.pa % c.size, 0);
        }
    }

    #[test]
    fn bootstrap_programs_image_and_direct_map() {
        let config = config_for_test();
        let machine = SoftMachine::new(2);
        let tlb1 = Tlb1::new(&config);
        tlb1.bootstrap(&machine, &config).unwrap();

        // Slot 0 covers the image, protected against invalidate-all.
        let slot0 = machine.tlb1_slot(CpuId::bsp(), 0);
        assert!(slot0.valid && slot0.protected);
        assert_eq!(slot0.va, config.kernel_image.start);
        assert_eq!(slot0.pa, config.kernel_load_pa);
        assert!(slot0.size >= config.kernel_image.end - config.kernel_image.start);

        // Both RAM extents are reachable through the direct map.
        for extent in &config.extents {
            let va = config.dmap_base + extent.base;
            let (pa, attr) = tlb1.lookup(va).unwrap();
            assert_eq!(pa, extent.base);
            assert_eq!(attr, MemAttr::normal());
        }
        assert!(tlb1.lookup(config.device_window.start).is_none());
    }

    #[test]
    fn snapshot_replicates_onto_another_cpu() {
        let config = config_for_test();
        let machine = SoftMachine::new(2);
        let tlb1 = Tlb1::new(&config);
        tlb1.bootstrap(&machine, &config).unwrap();

        let other = CpuId::new(1);
        assert!(!machine.tlb1_slot(other, 0).valid);
        machine.set_current_cpu(other);
        tlb1.snapshot().install(&machine);
        assert_eq!(machine.tlb1_slot(other, 0), machine.tlb1_slot(CpuId::bsp(), 0));
    }

    #[test]
    fn device_mappings_decompose_and_program_all_cpus() {
        let config = config_for_test();
        let machine = SoftMachine::new(2);
        let tlb1 = Tlb1::new(&config);

        let va = tlb1
            .map_device(&machine, 0x1000_0000, 300 * MIB, MemAttr::io())
            .unwrap();
        assert_eq!(va % (256 * MIB), 0);
        assert_eq!(tlb1.nr_free(), config.tlb1_slots - 6);

        // Every CPU got identical programming.
        for slot in 0..config.tlb1_slots {
            assert_eq!(
                machine.tlb1_slot(CpuId::bsp(), slot),
                machine.tlb1_slot(CpuId::new(1), slot)
            );
        }
        let (pa, attr) = tlb1.lookup(va + 17 * MIB).unwrap();
        assert_eq!(pa, 0x1000_0000 + 17 * MIB);
        assert_eq!(attr, MemAttr::io());
    }

    #[test]
    fn exhausted_slots_fail_without_partial_programming() {
        let mut config = config_for_test();
        config.tlb1_slots = 3;
        let machine = SoftMachine::new(1);
        let tlb1 = Tlb1::new(&config);

        // 300 MiB wants six blocks; three slots cannot hold them.
        let err = tlb1.map_device(&machine, 0x1000_0000, 300 * MIB, MemAttr::io());
        assert_eq!(err, Err(Error::NotEnoughResources));
        assert_eq!(tlb1.nr_free(), 3);
        for slot in 0..3 {
            assert!(!machine.tlb1_slot(CpuId::bsp(), slot).valid);
        }

        // A second attempt with enough slots starts at the same cursor.
        config.tlb1_slots = 6;
        let tlb1 = Tlb1::new(&config);
        let va = tlb1
            .map_device(&machine, 0x1000_0000, 300 * MIB, MemAttr::io())
            .unwrap();
        assert_eq!(tlb1.nr_free(), 0);
        assert!(tlb1.lookup(va).is_some());
    }

    #[test]
    fn covering_mappings_are_reused() {
        let config = config_for_test();
        let machine = SoftMachine::new(1);
        let tlb1 = Tlb1::new(&config);

        let base = tlb1
            .map_device(&machine, 0x4000_0000, 16 * MIB, MemAttr::io())
            .unwrap();
        let free = tlb1.nr_free();

        // A sub-range with matching attributes costs nothing.
        let again = tlb1
            .map_device(&machine, 0x4010_0000, 0x2000, MemAttr::io())
            .unwrap();
        assert_eq!(again, base + 0x10_0000);
        assert_eq!(tlb1.nr_free(), free);

        // Unaligned requests keep their byte offset.
        let odd = tlb1
            .map_device(&machine, 0x4010_0123, 0x10, MemAttr::io())
            .unwrap();
        assert_eq!(odd, base + 0x10_0123);

        // Different attributes force a fresh block.
        let cached = tlb1
            .map_device(&machine, 0x4010_0000, 0x2000, MemAttr::normal())
            .unwrap();
        assert_ne!(cached & !(PAGE_SIZE - 1), again & !(PAGE_SIZE - 1));
        assert_eq!(tlb1.nr_free(), free - 1);
    }

    #[test]
    fn small_requests_take_one_covering_block() {
        let config = config_for_test();
        let machine = SoftMachine::new(1);
        let tlb1 = Tlb1::new(&config);

        // 8 KiB is not a power of four; one 16 KiB block covers it.
        let va = tlb1
            .map_device(&machine, 0x8000_0000, 0x2000, MemAttr::io())
            .unwrap();
        assert_eq!(tlb1.nr_free(), config.tlb1_slots - 1);
        assert!(tlb1.covers_io(0x8000_0000, 0x2000));
        assert_eq!(tlb1.lookup(va + 0x1000), Some((0x8000_1000, MemAttr::io())));

        // Releasing with the original length drops the whole block.
        tlb1.unmap_device(&machine, va, 0x2000).unwrap();
        assert_eq!(tlb1.nr_free(), config.tlb1_slots);
        assert!(!tlb1.covers_io(0x8000_0000, 0x2000));

        // A base misaligned for the covering size still decomposes.
        tlb1.map_device(&machine, 0x8000_1000, 0x2000, MemAttr::io())
            .unwrap();
        assert_eq!(tlb1.nr_free(), config.tlb1_slots - 2);

        // Widening stops where the slack would exceed the request: a
        // 20 MiB region takes 16 + 4 MiB blocks, not one of 64 MiB.
        tlb1.map_device(&machine, 0x4000_0000, 20 * MIB, MemAttr::io())
            .unwrap();
        assert_eq!(tlb1.nr_free(), config.tlb1_slots - 4);
    }

    #[test]
    fn unmap_releases_only_contained_device_blocks() {
        let config = config_for_test();
        let machine = SoftMachine::new(1);
        let tlb1 = Tlb1::new(&config);

        let va = tlb1
            .map_device(&machine, 0x4000_0000, 20 * MIB, MemAttr::io())
            .unwrap();
        let free = tlb1.nr_free();

        // Unmapping half the range keeps the blocks that poke out of it.
        tlb1.unmap_device(&machine, va, 16 * MIB).unwrap();
        assert_eq!(tlb1.nr_free(), free + 1);
        assert!(tlb1.lookup(va).is_none());
        assert!(tlb1.lookup(va + 16 * MIB).is_some());

        tlb1.unmap_device(&machine, va + 16 * MIB, 4 * MIB).unwrap();
        assert_eq!(tlb1.nr_free(), free + 2);

        // Addresses outside the device window are rejected.
        assert_eq!(
            tlb1.unmap_device(&machine, config.kernel_base, PAGE_SIZE),
            Err(Error::InvalidArgs)
        );
    }

    #[test]
    fn change_attr_rewrites_whole_blocks() {
        let config = config_for_test();
        let machine = SoftMachine::new(2);
        let tlb1 = Tlb1::new(&config);

        let va = tlb1
            .map_device(&machine, 0x4000_0000, 20 * MIB, MemAttr::io())
            .unwrap();
        assert_eq!(
            tlb1.change_attr(&machine, va, 20 * MIB, MemAttr::normal()),
            Ok(true)
        );
        assert_eq!(tlb1.lookup(va).unwrap().1, MemAttr::normal());
        assert_eq!(
            machine.tlb1_slot(CpuId::new(1), 0).attr,
            MemAttr::normal()
        );

        // A range cutting through a block cannot be honored.
        assert_eq!(
            tlb1.change_attr(&machine, va, MIB, MemAttr::io()),
            Err(Error::InvalidArgs)
        );
        // A range touching no block is not handled here.
        assert_eq!(
            tlb1.change_attr(&machine, va + 64 * MIB, MIB, MemAttr::io()),
            Ok(false)
        );
    }

    #[test]
    fn io_coverage_is_visible() {
        let config = config_for_test();
        let machine = SoftMachine::new(1);
        let tlb1 = Tlb1::new(&config);
        tlb1.bootstrap(&machine, &config).unwrap();

        assert!(!tlb1.covers_io(0x4000_0000, 0x1000));
        tlb1.map_device(&machine, 0x4000_0000, 64 << 10, MemAttr::io())
            .unwrap();
        assert!(tlb1.covers_io(0x4000_0000, 0x1000));
        assert!(tlb1.covers_io(0x4000_8000, 0x8000));
        assert!(!tlb1.covers_io(0x4000_8000, 0x10000));
        // The cached direct map does not count as device coverage.
        assert!(!tlb1.covers_io(0, 0x1000));
    }
}
