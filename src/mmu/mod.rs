// SPDX-License-Identifier: MPL-2.0

//! The translation core and its entry points.
//!
//! An [`Mmu`] owns every piece of translation state for one coherence
//! domain: the kernel's translation tree, the reverse map, the TLB1 slot
//! ledger, the per-CPU context-id banks, and the physical-frame records.
//! User [`AddressSpace`]s are created through it and mutated through it.
//!
//! The primary TLB holds only what the miss handler put there. Mapping
//! operations therefore never program TLB0; they edit the trees and
//! invalidate, and the next access refills through [`Mmu::refill_for_miss`].
//! TLB1 is the opposite: it is explicitly programmed, kept identical on
//! every CPU, and never refilled.
//!
//! Lock order, outermost first: the reverse-map lock, then one address
//! space's tree lock, then the TLB0 invalidate lock. The TLB1 ledger lock
//! is self-contained and never taken with a tree lock held.


use core::ops::Range;

use align_ext::AlignExt;
use spin::Mutex;

use crate::{
    boot::BootConfig,
    cpu::CpuId,
    error::Error,
    machine::Machine,
    page_prop::{Access, EnterFlags, MemAttr},
    page_table::{
        pte::{access_flags, Pte, PteFlags},
        span, NativeScheme, PagingScheme, PtBudget,
    },
    phys::PhysMap,
    prelude::*,
    pv::{PvIndex, PvInner},
    space::AddressSpace,
    tid::{ContextBank, Tid, TID_KERNEL, TID_NONE},
    tlb0::Tlb0,
    tlb1::{Tlb1, Tlb1Image},
};

/// Most reference bits one [`Mmu::ts_referenced`] call will harvest.
const TS_REFERENCED_MAX: usize = 5;

/// The programming of one primary-TLB entry, as the miss handler must
/// hand it to the hardware.
///
/// Produced by [`Mmu::refill_for_miss`]. The write permissions already
/// reflect dirty tracking: a writable page that has not collected its
/// modified bit yet comes back without the write-enable bits, so the
/// first store re-faults and is seen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefillEntry {
    /// Base of the virtual page.
    pub va: Vaddr,
    /// Base of the physical page.
    pub pa: Paddr,
    /// Cache attributes of the page.
    pub attr: MemAttr,
    /// Context id to tag the entry with.
    pub tid: Tid,
    /// Rights to grant supervisor accesses.
    pub sup_access: Access,
    /// Rights to grant user accesses.
    pub user_access: Access,
}

/// The translation core of one machine.
pub struct Mmu<S: PagingScheme = NativeScheme> {
    machine: Arc<dyn Machine>,
    config: BootConfig,
    phys: PhysMap,
    pv: PvIndex<S>,
    tlb0: Tlb0,
    tlb1: Tlb1,
    budget: Arc<PtBudget>,
    kernel: Arc<AddressSpace<S>>,
    banks: Vec<Mutex<ContextBank<S>>>,
}

impl<S: PagingScheme> Mmu<S> {
    /// Brings the boot CPU under management.
    ///
    /// Validates the configuration, builds the kernel tree with its window
    /// fully pre-allocated, programs the wired TLB1 entries for the kernel
    /// image and the direct map, and leaves the boot CPU running in the
    /// privileged context.
    pub fn bootstrap(machine: Arc<dyn Machine>, config: BootConfig) -> Result<Self> {
        config.validate::<S>()?;

        let budget = Arc::new(PtBudget::new(config.table_page_limit));
        if let Some(limit) = config.table_page_limit {
            // The root node plus full coverage of the kernel window must
            // fit, or the window could not be populated even on an idle
            // machine.
            if limit < config.kernel_table_pages::<S>() + 1 {
                log::debug!("[mmu] table-page limit below kernel window needs");
                return Err(Error::InvalidArgs);
            }
        }

        let kernel =
            AddressSpace::new_kernel(config.kernel_base, config.nr_cpus, budget.clone())?;
        kernel.tree().ensure_covered(&config.kernel_window)?;

        let phys = PhysMap::new(&config);
        let pv = PvIndex::new(phys.nr_frames(), config.pv_entry_limit, config.pv_high_water);

        let tlb1 = Tlb1::new(&config);
        tlb1.bootstrap(machine.as_ref(), &config)?;

        machine.set_context(TID_KERNEL);
        kernel.mark_active(machine.current_cpu());

        let banks = (0..config.nr_cpus)
            .map(|i| Mutex::new(ContextBank::new(CpuId::new(i), config.tid_limit)))
            .collect();

        log::info!(
            "[mmu] bootstrapped: {} cpus, {} ram frames, {} table pages",
            config.nr_cpus,
            phys.nr_frames(),
            budget.in_use(),
        );

        Ok(Mmu {
            machine,
            config,
            phys,
            pv,
            tlb0: Tlb0::new(),
            tlb1,
            budget,
            kernel,
            banks,
        })
    }

    /// Captures the TLB1 programming an application CPU must install
    /// before enabling translation.
    pub fn prepare_ap(&self) -> Tlb1Image {
        self.tlb1.snapshot()
    }

    /// Brings the calling application CPU under management.
    ///
    /// `image` comes from [`Mmu::prepare_ap`] on an already-running CPU.
    pub fn bootstrap_ap(&self, image: &Tlb1Image) {
        image.install(self.machine.as_ref());
        self.machine.set_context(TID_KERNEL);
        self.kernel.mark_active(self.machine.current_cpu());
    }

    /// The kernel's address space.
    pub fn kernel_space(&self) -> &Arc<AddressSpace<S>> {
        &self.kernel
    }

    /// Creates an empty user address space.
    pub fn create_space(&self) -> Result<Arc<AddressSpace<S>>> {
        AddressSpace::new_user(self.config.nr_cpus, self.budget.clone())
    }

    /// Makes `space` the translation domain of the calling CPU.
    ///
    /// A context id is assigned on first activation on each CPU and kept
    /// across deactivations until the bank recycles it. The caller must
    /// stay on one CPU for the duration of the call, as on any context
    /// switch path.
    pub fn activate(&self, space: &Arc<AddressSpace<S>>) {
        let cpu = self.machine.current_cpu();
        if space.is_kernel() {
            self.machine.set_context(TID_KERNEL);
            return;
        }
        let mut tid = space.context_on(cpu);
        if tid == TID_NONE {
            let mut bank = self.banks[cpu.as_usize()].lock();
            tid = bank.alloc(self.machine.as_ref(), &self.tlb0, space);
        }
        space.mark_active(cpu);
        self.machine.set_context(tid);
    }

    /// Detaches the calling CPU from `space`, returning it to the
    /// privileged context.
    ///
    /// The space keeps its context id; reactivation is a register write
    /// unless the bank recycled the id in between.
    pub fn deactivate(&self, space: &Arc<AddressSpace<S>>) {
        space.mark_inactive(self.machine.current_cpu());
        self.machine.set_context(TID_KERNEL);
    }

    /// Resolves a primary-TLB miss.
    ///
    /// `current` is the space the faulting context was running in; kernel
    /// addresses resolve against the kernel space regardless. On success
    /// the returned entry is ready to be written into TLB0, with the
    /// reference bit already merged into the translation entry, plus the
    /// modified bit when `access` includes a permitted write.
    ///
    /// A miss on an absent translation is [`Error::PageFault`]; a miss on
    /// a present translation that does not permit `access` is
    /// [`Error::AccessDenied`]. Both are the embedder's cue to enter its
    /// fault handling.
    pub fn refill_for_miss(
        &self,
        current: &Arc<AddressSpace<S>>,
        va: Vaddr,
        access: Access,
        user: bool,
    ) -> Result<RefillEntry> {
        let page = va & !(PAGE_SIZE - 1);
        let space = if page >= self.config.kernel_base
            && page - self.config.kernel_base < span::<S>()
        {
            &self.kernel
        } else if page < span::<S>() {
            current
        } else {
            // The image, the direct map, and the device window live in
            // TLB1 and never miss in TLB0; a miss there means there is
            // genuinely no translation.
            return Err(Error::PageFault);
        };

        let tree = space.tree();
        let Some(pte) = tree.lookup(page) else {
            return Err(Error::PageFault);
        };
        if !pte.grants(access, user) {
            return Err(Error::AccessDenied);
        }

        let mut state = PteFlags::REFERENCED;
        if access.contains(Access::WRITE) {
            state |= PteFlags::MODIFIED;
        }
        let Some(merged) = tree.merge_flags(page, state) else {
            return Err(Error::PageFault);
        };

        // Write enable is withheld until the modified bit is in place, so
        // the first store through a clean mapping comes back here.
        let mut sup_access = merged.sup_access();
        let mut user_access = merged.user_access();
        if !merged.is_modified() {
            sup_access -= Access::WRITE;
            user_access -= Access::WRITE;
        }

        let tid = space.context_on(self.machine.current_cpu());
        if tid == TID_NONE {
            return Err(Error::PageFault);
        }

        Ok(RefillEntry {
            va: page,
            pa: merged.pa(),
            attr: merged.attr(),
            tid,
            sup_access,
            user_access,
        })
    }

    /// Maps `va` to `pa` in a user space.
    ///
    /// An existing mapping of the same address is replaced. RAM pages are
    /// reverse-mapped unless [`EnterFlags::UNMANAGED`] asks otherwise, and
    /// take their cache attributes from their frame record; other physical
    /// addresses are mapped uncached.
    ///
    /// When the table-page budget is exhausted the call waits for another
    /// space to release pages, unless [`EnterFlags::NO_WAIT`] turns the
    /// wait into [`Error::NoMemory`]. Reverse-map pool exhaustion is never
    /// waited out.
    pub fn enter(
        &self,
        space: &Arc<AddressSpace<S>>,
        va: Vaddr,
        pa: Paddr,
        access: Access,
        flags: EnterFlags,
    ) -> Result<()> {
        if space.is_kernel() {
            return Err(Error::InvalidArgs);
        }
        if !crate::is_page_aligned(va) || !crate::is_page_aligned(pa) || access.is_empty() {
            return Err(Error::InvalidArgs);
        }
        if va >= span::<S>() {
            return Err(Error::InvalidArgs);
        }

        let managed_frame = if flags.contains(EnterFlags::UNMANAGED) {
            None
        } else {
            self.phys.frame_index(pa)
        };
        let attr = self
            .phys
            .record(pa)
            .map_or(MemAttr::io(), |record| record.attr());
        let wired = flags.contains(EnterFlags::WIRED);

        let mut pte_flags = PteFlags::VALID | access_flags(access, true);
        if wired {
            pte_flags |= PteFlags::WIRED;
        }
        if managed_frame.is_some() {
            pte_flags |= PteFlags::MANAGED;
        }
        let pte = Pte::new(pa, attr, pte_flags);

        loop {
            let mut pv = self.pv.write();
            let mut tree = space.tree();

            match tree.lookup(va) {
                Some(old) if old.pa() == pa => {
                    // Same frame again: rights, wiring, or managedness
                    // change in place. The old modified bit is folded
                    // before the fresh entry discards it.
                    let mut pte = pte;
                    if old.is_tracked() {
                        if managed_frame.is_some() {
                            // The managed path below indexes the mapping
                            // itself; drop the tracked entry first.
                            if let Some(frame) = self.phys.frame_index(pa) {
                                pv.remove(frame, space, va);
                            }
                        } else {
                            pte = pte.with(PteFlags::TRACKED);
                        }
                    }
                    if managed_frame.is_some() != old.is_managed() {
                        if let Some(frame) = managed_frame {
                            pv.insert(frame, space, va)?;
                        } else if old.is_managed() {
                            if let Some(frame) = self.phys.frame_index(pa) {
                                pv.remove(frame, space, va);
                            }
                        }
                    }
                    if old.is_managed() && old.is_modified() {
                        if let Some(record) = self.phys.record(pa) {
                            record.mark_dirty();
                        }
                    }
                    if old.is_wired() != wired {
                        space.note_wired_flip(wired);
                    }
                    tree.replace(va, pte);
                    self.tlb0.flush_page(self.machine.as_ref(), va);
                    self.sync_icache_for_enter(access, pa);
                    return Ok(());
                }
                Some(_) => {
                    if let Some(old) = tree.clear(va) {
                        self.finish_teardown(&mut pv, space, va, old);
                    }
                }
                None => {}
            }

            let seen = self.budget.generation();
            if let Err(e) = tree.install(va, pte) {
                drop(tree);
                drop(pv);
                if flags.contains(EnterFlags::NO_WAIT) {
                    return Err(e);
                }
                self.budget.wait_until_freed(seen);
                continue;
            }

            if let Some(frame) = managed_frame {
                if let Err(e) = pv.insert(frame, space, va) {
                    tree.clear(va);
                    return Err(e);
                }
            }
            space.note_mapped(wired);
            self.sync_icache_for_enter(access, pa);
            return Ok(());
        }
    }

    /// Unmaps every page of `range` from a user space.
    ///
    /// Wired mappings go too; wiring only exempts a page from pageout
    /// bookkeeping. Modified bits are folded into the frame records as the
    /// entries disappear.
    pub fn remove(&self, space: &Arc<AddressSpace<S>>, range: Range<Vaddr>) -> Result<()> {
        self.check_user_range(space, &range)?;

        let mut pv = self.pv.write();
        let mut tree = space.tree();
        if space.resident_pages() == 0 {
            return Ok(());
        }

        let mut va = range.start;
        while va < range.end {
            let Some(found) = tree.next_present(va) else {
                break;
            };
            if found >= range.end {
                break;
            }
            let stop = crate::page_table::leaf_window_end(found).min(range.end);
            let mut page = found;
            while page < stop {
                if let Some(old) = tree.clear(page) {
                    self.finish_teardown(&mut pv, space, page, old);
                }
                page += PAGE_SIZE;
            }
            va = stop;
        }
        Ok(())
    }

    /// Reduces the rights of every mapping in `range` to at most `access`.
    ///
    /// Only write permission is ever taken away: revoking read unmaps the
    /// range, and execute rights are left as entered. Pages that lose
    /// write access also lose their modified and referenced bits, after
    /// folding the modified bit into the frame record.
    pub fn protect(
        &self,
        space: &Arc<AddressSpace<S>>,
        range: Range<Vaddr>,
        access: Access,
    ) -> Result<()> {
        if !access.contains(Access::READ) {
            return self.remove(space, range);
        }
        self.check_user_range(space, &range)?;
        if access.contains(Access::WRITE) {
            return Ok(());
        }

        let mut tree = space.tree();
        let mut va = range.start;
        while va < range.end {
            let Some(found) = tree.next_present(va) else {
                break;
            };
            if found >= range.end {
                break;
            }
            let stop = crate::page_table::leaf_window_end(found).min(range.end);
            let mut page = found;
            while page < stop {
                if let Some(pte) = tree.lookup(page) {
                    if pte.grants(Access::WRITE, false) || pte.grants(Access::WRITE, true) {
                        if pte.is_managed() && pte.is_modified() {
                            if let Some(record) = self.phys.record(pte.pa()) {
                                record.mark_dirty();
                            }
                        }
                        let stripped = pte.cleared(
                            PteFlags::SW
                                | PteFlags::UW
                                | PteFlags::MODIFIED
                                | PteFlags::REFERENCED,
                        );
                        tree.replace(page, stripped);
                        self.tlb0.flush_page(self.machine.as_ref(), page);
                    }
                }
                page += PAGE_SIZE;
            }
            va = stop;
        }
        Ok(())
    }

    /// Clears the wired bit on every wired mapping in `range`.
    ///
    /// The translations stay; only the pageout exemption and the wired
    /// counter change, so no invalidation is needed.
    pub fn unwire(&self, space: &Arc<AddressSpace<S>>, range: Range<Vaddr>) -> Result<()> {
        self.check_user_range(space, &range)?;

        let mut tree = space.tree();
        let mut va = range.start;
        while va < range.end {
            let Some(found) = tree.next_present(va) else {
                break;
            };
            if found >= range.end {
                break;
            }
            let stop = crate::page_table::leaf_window_end(found).min(range.end);
            let mut page = found;
            while page < stop {
                if let Some(pte) = tree.lookup(page) {
                    if pte.is_wired() {
                        tree.replace(page, pte.cleared(PteFlags::WIRED));
                        space.note_wired_flip(false);
                    }
                }
                page += PAGE_SIZE;
            }
            va = stop;
        }
        Ok(())
    }

    /// The physical address `va` translates to in `space`, if any.
    pub fn extract(&self, space: &Arc<AddressSpace<S>>, va: Vaddr) -> Option<Paddr> {
        let tree = space.tree();
        if !tree.contains(va) {
            return None;
        }
        tree.lookup(va).map(|pte| pte.pa() | (va & (PAGE_SIZE - 1)))
    }

    /// Like [`Mmu::extract`], but only for RAM mappings granting `access`,
    /// and the frame comes back held.
    ///
    /// The hold is a pageout hint, not a lock; release it with
    /// [`Mmu::unhold_page`] once the frame's contents are no longer used.
    pub fn extract_and_hold(
        &self,
        space: &Arc<AddressSpace<S>>,
        va: Vaddr,
        access: Access,
    ) -> Option<Paddr> {
        let tree = space.tree();
        if !tree.contains(va) {
            return None;
        }
        let pte = tree.lookup(va)?;
        if !pte.grants(access, !space.is_kernel()) {
            return None;
        }
        let pa = pte.pa() | (va & (PAGE_SIZE - 1));
        let record = self.phys.record(pa)?;
        record.hold();
        Some(pa)
    }

    /// Releases a hold taken by [`Mmu::extract_and_hold`].
    pub fn unhold_page(&self, pa: Paddr) {
        if let Some(record) = self.phys.record(pa) {
            record.unhold();
        }
    }

    /// Returns whether any managed mapping of the page has been referenced
    /// since the bit was last harvested.
    pub fn is_referenced(&self, pa: Paddr) -> bool {
        let Some(frame) = self.phys.frame_index(pa) else {
            return false;
        };
        let pv = self.pv.read();
        pv.entries(frame).any(|(space, va)| {
            let tree = space.tree();
            tree.lookup(va)
                .is_some_and(|pte| pte.is_managed() && pte.is_referenced())
        })
    }

    /// Harvests and clears reference bits over the page's mappings.
    ///
    /// Returns the number of mappings found referenced, stopping early
    /// once the count is an unambiguous activity signal. The cleared
    /// translations are invalidated so further accesses count anew.
    pub fn ts_referenced(&self, pa: Paddr) -> usize {
        let Some(frame) = self.phys.frame_index(pa) else {
            return 0;
        };
        let pv = self.pv.read();
        let mut harvested = 0;
        for (space, va) in pv.entries(frame) {
            if harvested >= TS_REFERENCED_MAX {
                break;
            }
            let mut tree = space.tree();
            let Some(pte) = tree.lookup(va) else {
                continue;
            };
            if !pte.is_managed() || !pte.is_referenced() {
                continue;
            }
            tree.replace(va, pte.cleared(PteFlags::REFERENCED));
            drop(tree);
            self.tlb0.flush_page(self.machine.as_ref(), va);
            harvested += 1;
        }
        harvested
    }

    /// Returns whether any managed mapping of the page has collected the
    /// modified bit.
    ///
    /// Dirty state already folded into the frame record is reported by
    /// [`Mmu::is_page_dirty`] instead.
    pub fn is_modified(&self, pa: Paddr) -> bool {
        let Some(frame) = self.phys.frame_index(pa) else {
            return false;
        };
        let pv = self.pv.read();
        pv.entries(frame).any(|(space, va)| {
            let tree = space.tree();
            tree.lookup(va)
                .is_some_and(|pte| pte.is_managed() && pte.is_modified())
        })
    }

    /// Clears the modified bit on every mapping of the page, folding it
    /// into the frame record first.
    pub fn clear_modify(&self, pa: Paddr) {
        let Some(frame) = self.phys.frame_index(pa) else {
            return;
        };
        let pv = self.pv.read();
        for (space, va) in pv.entries(frame) {
            let mut tree = space.tree();
            let Some(pte) = tree.lookup(va) else {
                continue;
            };
            if !pte.is_managed() || !pte.is_modified() {
                continue;
            }
            if let Some(record) = self.phys.record(pa) {
                record.mark_dirty();
            }
            tree.replace(va, pte.cleared(PteFlags::MODIFIED));
            drop(tree);
            self.tlb0.flush_page(self.machine.as_ref(), va);
        }
    }

    /// Revokes write permission on every mapping of the page.
    ///
    /// Modified bits are folded into the frame record as they are cleared.
    /// The pager calls this before cleaning a page so new stores fault.
    pub fn remove_write(&self, pa: Paddr) {
        let Some(frame) = self.phys.frame_index(pa) else {
            return;
        };
        let pv = self.pv.read();
        for (space, va) in pv.entries(frame) {
            let mut tree = space.tree();
            let Some(pte) = tree.lookup(va) else {
                continue;
            };
            if !pte.is_managed() {
                continue;
            }
            if !pte.grants(Access::WRITE, false) && !pte.grants(Access::WRITE, true) {
                continue;
            }
            if pte.is_modified() {
                if let Some(record) = self.phys.record(pa) {
                    record.mark_dirty();
                }
            }
            tree.replace(
                va,
                pte.cleared(PteFlags::SW | PteFlags::UW | PteFlags::MODIFIED),
            );
            drop(tree);
            self.tlb0.flush_page(self.machine.as_ref(), va);
        }
    }

    /// Unmaps the page from every address space it appears in.
    ///
    /// This is the pager's eviction step; afterwards the page has no
    /// translations left and [`Mmu::is_page_dirty`] tells whether any of
    /// them had modified it.
    pub fn remove_all(&self, pa: Paddr) {
        let Some(frame) = self.phys.frame_index(pa) else {
            return;
        };
        let mut pv = self.pv.write();
        self.drain_frame(&mut pv, frame);
    }

    /// Clears every mapping the reverse map lists for one frame.
    fn drain_frame(&self, pv: &mut PvInner<S>, frame: usize) {
        loop {
            let head = pv
                .entries(frame)
                .next()
                .map(|(space, va)| (space.clone(), va));
            let Some((space, va)) = head else {
                break;
            };
            let old = {
                let mut tree = space.tree();
                tree.clear(va)
            };
            let Some(old) = old else {
                panic!("reverse map lists unmapped page at {va:#x}");
            };
            self.finish_teardown(pv, &space, va, old);
        }
    }

    /// The number of wired mappings of the page.
    pub fn page_wired_mappings(&self, pa: Paddr) -> usize {
        let Some(frame) = self.phys.frame_index(pa) else {
            return 0;
        };
        let pv = self.pv.read();
        pv.entries(frame)
            .filter(|(space, va)| space.tree().lookup(*va).is_some_and(|pte| pte.is_wired()))
            .count()
    }

    /// Returns whether `space` maps the page, scanning at most a handful
    /// of reverse-map entries.
    ///
    /// A `false` from a page with many mappings may be wrong; callers use
    /// this as a cheap filter, not as truth.
    pub fn page_exists_quick(&self, space: &Arc<AddressSpace<S>>, pa: Paddr) -> bool {
        let Some(frame) = self.phys.frame_index(pa) else {
            return false;
        };
        let pv = self.pv.read();
        pv.entries(frame).take(16).any(|(s, _)| Arc::ptr_eq(s, space))
    }

    /// Returns whether any reverse-map entry exists for the page.
    pub fn page_is_mapped(&self, pa: Paddr) -> bool {
        let Some(frame) = self.phys.frame_index(pa) else {
            return false;
        };
        self.pv.read().entries(frame).next().is_some()
    }

    /// Reverse-indexes the unmanaged mapping at `va` so its frame can be
    /// resolved back with [`Mmu::mapping_of`], typically for a fixed DMA
    /// buffer.
    ///
    /// Tracked mappings never take part in pageout bookkeeping. Tracking
    /// a mapping that is already managed or tracked changes nothing.
    pub fn track_page(&self, space: &Arc<AddressSpace<S>>, va: Vaddr) -> Result<()> {
        let va = va & !(PAGE_SIZE - 1);
        let mut pv = self.pv.write();
        let mut tree = space.tree();
        let Some(pte) = tree.lookup(va) else {
            return Err(Error::PageFault);
        };
        if pte.is_managed() || pte.is_tracked() {
            return Ok(());
        }
        let Some(frame) = self.phys.frame_index(pte.pa()) else {
            return Err(Error::InvalidArgs);
        };
        pv.insert(frame, space, va)?;
        tree.replace(va, pte.with(PteFlags::TRACKED));
        if let Some(record) = self.phys.record(pte.pa()) {
            record.set_tracked(true);
        }
        Ok(())
    }

    /// Undoes [`Mmu::track_page`] for the mapping at `va`.
    pub fn untrack_page(&self, space: &Arc<AddressSpace<S>>, va: Vaddr) {
        let va = va & !(PAGE_SIZE - 1);
        let mut pv = self.pv.write();
        let mut tree = space.tree();
        let Some(pte) = tree.lookup(va) else {
            return;
        };
        if !pte.is_tracked() {
            return;
        }
        let Some(frame) = self.phys.frame_index(pte.pa()) else {
            return;
        };
        pv.remove(frame, space, va);
        tree.replace(va, pte.cleared(PteFlags::TRACKED));
        if pv.entries(frame).next().is_none() {
            if let Some(record) = self.phys.record(pte.pa()) {
                record.set_tracked(false);
            }
        }
    }

    /// The virtual address `space` maps the frame at, if the reverse map
    /// has it indexed (managed or tracked).
    pub fn mapping_of(&self, space: &Arc<AddressSpace<S>>, pa: Paddr) -> Option<Vaddr> {
        let frame = self.phys.frame_index(pa)?;
        let pv = self.pv.read();
        pv.entries(frame)
            .find(|(s, _)| Arc::ptr_eq(s, space))
            .map(|(_, va)| va | (pa & (PAGE_SIZE - 1)))
    }

    /// Changes the cache attributes future and existing mappings of the
    /// RAM page use.
    pub fn set_page_attr(&self, pa: Paddr, attr: MemAttr) -> Result<()> {
        if !attr.is_valid() {
            return Err(Error::InvalidArgs);
        }
        let Some(record) = self.phys.record(pa) else {
            return Err(Error::InvalidArgs);
        };
        record.set_attr(attr);

        let Some(frame) = self.phys.frame_index(pa) else {
            return Err(Error::InvalidArgs);
        };
        let pv = self.pv.read();
        for (space, va) in pv.entries(frame) {
            let mut tree = space.tree();
            let Some(pte) = tree.lookup(va) else {
                continue;
            };
            tree.replace(va, Pte::new(pte.pa(), attr, pte.flags()));
            drop(tree);
            self.tlb0.flush_page(self.machine.as_ref(), va);
        }
        Ok(())
    }

    /// Returns whether dirty state has been folded into the frame record.
    pub fn is_page_dirty(&self, pa: Paddr) -> bool {
        self.phys.record(pa).is_some_and(|record| record.is_dirty())
    }

    /// Clears folded dirty state, typically after the pager cleaned the
    /// page.
    pub fn clear_page_dirty(&self, pa: Paddr) {
        if let Some(record) = self.phys.record(pa) {
            record.clear_dirty();
        }
    }

    /// Zeroes one RAM page through the direct map.
    pub fn zero_page(&self, pa: Paddr) -> Result<()> {
        if !crate::is_page_aligned(pa) {
            return Err(Error::InvalidArgs);
        }
        let va = self.phys.dmap_va(pa).ok_or(Error::InvalidArgs)?;
        self.machine.zero(va, PAGE_SIZE);
        Ok(())
    }

    /// Zeroes a sub-range of one RAM page through the direct map.
    pub fn zero_page_area(&self, pa: Paddr, offset: usize, len: usize) -> Result<()> {
        if !crate::is_page_aligned(pa)
            || offset > PAGE_SIZE
            || len > PAGE_SIZE
            || offset + len > PAGE_SIZE
        {
            return Err(Error::InvalidArgs);
        }
        let va = self.phys.dmap_va(pa).ok_or(Error::InvalidArgs)?;
        self.machine.zero(va + offset, len);
        Ok(())
    }

    /// Copies one RAM page onto another through the direct map.
    pub fn copy_page(&self, src: Paddr, dst: Paddr) -> Result<()> {
        if !crate::is_page_aligned(src) || !crate::is_page_aligned(dst) {
            return Err(Error::InvalidArgs);
        }
        let src_va = self.phys.dmap_va(src).ok_or(Error::InvalidArgs)?;
        let dst_va = self.phys.dmap_va(dst).ok_or(Error::InvalidArgs)?;
        self.machine.copy(dst_va, src_va, PAGE_SIZE);
        Ok(())
    }

    /// Copies `len` bytes between two frame runs at arbitrary byte
    /// offsets, crossing page boundaries on either side as needed.
    pub fn copy_pages(
        &self,
        src: &[Paddr],
        mut src_off: usize,
        dst: &[Paddr],
        mut dst_off: usize,
        mut len: usize,
    ) -> Result<()> {
        while len > 0 {
            let src_pa = *src.get(src_off / PAGE_SIZE).ok_or(Error::InvalidArgs)?;
            let dst_pa = *dst.get(dst_off / PAGE_SIZE).ok_or(Error::InvalidArgs)?;
            let src_in = src_off & (PAGE_SIZE - 1);
            let dst_in = dst_off & (PAGE_SIZE - 1);
            let chunk = len.min(PAGE_SIZE - src_in).min(PAGE_SIZE - dst_in);
            let src_va = self.phys.dmap_va(src_pa).ok_or(Error::InvalidArgs)?;
            let dst_va = self.phys.dmap_va(dst_pa).ok_or(Error::InvalidArgs)?;
            self.machine.copy(dst_va + dst_in, src_va + src_in, chunk);
            src_off += chunk;
            dst_off += chunk;
            len -= chunk;
        }
        Ok(())
    }

    /// A momentary kernel mapping of one RAM page.
    ///
    /// Served by the direct map, so nothing is programmed and
    /// [`Mmu::quick_remove_page`] has nothing to undo.
    pub fn quick_enter_page(&self, pa: Paddr) -> Result<Vaddr> {
        if !crate::is_page_aligned(pa) {
            return Err(Error::InvalidArgs);
        }
        self.phys.dmap_va(pa).ok_or(Error::InvalidArgs)
    }

    /// Releases a [`Mmu::quick_enter_page`] mapping.
    pub fn quick_remove_page(&self, _va: Vaddr) {}

    /// A hint that `dst` is about to fault in the translations `src` holds
    /// for `range`.
    ///
    /// Misses are resolved from the trees at refill cost, so nothing is
    /// copied ahead of time.
    pub fn copy(
        &self,
        _dst: &Arc<AddressSpace<S>>,
        _src: &Arc<AddressSpace<S>>,
        _range: Range<Vaddr>,
    ) {
    }

    /// Makes the instruction cache coherent with `len` bytes at `va` in
    /// `space`.
    ///
    /// Unmapped pages in the range are skipped; RAM is reached through the
    /// direct map so the sweep works regardless of which CPU last wrote
    /// the data.
    pub fn sync_icache(&self, space: &Arc<AddressSpace<S>>, va: Vaddr, len: usize) {
        let end = va.saturating_add(len);
        let mut cur = va;
        while cur < end {
            let chunk_end = ((cur & !(PAGE_SIZE - 1)) + PAGE_SIZE).min(end);
            let pa = {
                let tree = space.tree();
                if tree.contains(cur) {
                    tree.lookup(cur).map(|pte| pte.pa() | (cur & (PAGE_SIZE - 1)))
                } else {
                    None
                }
            };
            if let Some(pa) = pa {
                if let Some(dva) = self.phys.dmap_va(pa) {
                    self.machine.sync_icache(dva, chunk_end - cur);
                }
            }
            cur = chunk_end;
        }
    }

    /// Maps one page into the kernel window, supervisor rwx, cacheable.
    pub fn kenter(&self, va: Vaddr, pa: Paddr) -> Result<()> {
        self.kenter_prot(va, pa, MemAttr::normal(), Access::all())
    }

    /// Maps one page into the kernel window with explicit attributes.
    pub fn kenter_attr(&self, va: Vaddr, pa: Paddr, attr: MemAttr) -> Result<()> {
        self.kenter_prot(va, pa, attr, Access::all())
    }

    /// Unmaps one kernel-window page.
    ///
    /// Unlike user unmapping this keeps no statistics and frees no table
    /// pages; the window's tables are permanent.
    pub fn kremove(&self, va: Vaddr) {
        debug_assert!(self.config.kernel_window.contains(&va));
        let old = {
            let mut tree = self.kernel.tree();
            if !tree.contains(va) {
                return;
            }
            tree.clear(va)
        };
        if old.is_none() {
            log::debug!("kremove of unmapped window page at {va:#x}");
            return;
        }
        self.tlb0.flush_page(self.machine.as_ref(), va);
    }

    /// The physical address a kernel virtual address translates to.
    ///
    /// Covers the whole kernel half: window mappings through the tree, and
    /// the image, direct-map, and device regions through TLB1.
    pub fn kextract(&self, va: Vaddr) -> Option<Paddr> {
        {
            let tree = self.kernel.tree();
            if tree.contains(va) {
                if let Some(pte) = tree.lookup(va) {
                    return Some(pte.pa() | (va & (PAGE_SIZE - 1)));
                }
            }
        }
        self.tlb1.lookup(va).map(|(pa, _)| pa)
    }

    /// Maps a batch of frames at consecutive window addresses.
    ///
    /// Each frame is mapped with its record's cache attributes. Used for
    /// transient kernel buffers over caller-picked window space.
    pub fn qenter(&self, sva: Vaddr, frames: &[Paddr]) -> Result<()> {
        self.check_window_range(sva, frames.len() * PAGE_SIZE)?;
        for (i, &pa) in frames.iter().enumerate() {
            let attr = self
                .phys
                .record(pa)
                .map_or(MemAttr::normal(), |record| record.attr());
            self.kenter_prot(sva + i * PAGE_SIZE, pa, attr, Access::all())?;
        }
        Ok(())
    }

    /// Unmaps a batch mapped by [`Mmu::qenter`].
    pub fn qremove(&self, sva: Vaddr, count: usize) {
        for i in 0..count {
            self.kremove(sva + i * PAGE_SIZE);
        }
    }

    /// Maps the physical range into the kernel window starting at `va`,
    /// returning the first address past the mapping.
    pub fn map(&self, va: Vaddr, pa: Range<Paddr>, access: Access) -> Result<Vaddr> {
        if !crate::is_page_aligned(va)
            || !crate::is_page_aligned(pa.start)
            || !crate::is_page_aligned(pa.end)
            || pa.start >= pa.end
        {
            return Err(Error::InvalidArgs);
        }
        let len = pa.end - pa.start;
        self.check_window_range(va, len)?;
        for offset in (0..len).step_by(PAGE_SIZE) {
            self.kenter_prot(va + offset, pa.start + offset, MemAttr::normal(), access)?;
        }
        Ok(va + len)
    }

    /// Maps a device range uncached and guarded, returning its virtual
    /// address inside the device window.
    pub fn mapdev(&self, pa: Paddr, len: usize) -> Result<Vaddr> {
        self.mapdev_attr(pa, len, MemAttr::io())
    }

    /// Maps a device range with explicit attributes.
    ///
    /// Served from TLB1 blocks shared by every CPU; a block already
    /// covering the range with the same attributes is reused.
    pub fn mapdev_attr(&self, pa: Paddr, len: usize, attr: MemAttr) -> Result<Vaddr> {
        self.tlb1.map_device(self.machine.as_ref(), pa, len, attr)
    }

    /// Releases a device mapping made by [`Mmu::mapdev`].
    ///
    /// Only blocks fully inside `[va, va + len)` are dropped; the wired
    /// bring-up entries are never touched.
    pub fn unmapdev(&self, va: Vaddr, len: usize) -> Result<()> {
        self.tlb1.unmap_device(self.machine.as_ref(), va, len)
    }

    /// Changes the cache attributes of an existing kernel-half mapping.
    ///
    /// A range served by TLB1 blocks must line up with whole blocks; a
    /// range served by the kernel window must be fully mapped. Anything
    /// else is [`Error::InvalidArgs`] with no change made.
    pub fn change_attr(&self, va: Vaddr, len: usize, attr: MemAttr) -> Result<()> {
        if len == 0 || !attr.is_valid() {
            return Err(Error::InvalidArgs);
        }
        if self.tlb1.change_attr(self.machine.as_ref(), va, len, attr)? {
            return Ok(());
        }

        let start = va.align_down(PAGE_SIZE);
        let end = (va + len).align_up(PAGE_SIZE);
        let mut tree = self.kernel.tree();
        let mut page = start;
        while page < end {
            if !tree.contains(page) || tree.lookup(page).is_none() {
                return Err(Error::InvalidArgs);
            }
            page += PAGE_SIZE;
        }
        let mut page = start;
        while page < end {
            if let Some(pte) = tree.lookup(page) {
                tree.replace(page, Pte::new(pte.pa(), attr, pte.flags()));
                self.tlb0.flush_page(self.machine.as_ref(), page);
            }
            page += PAGE_SIZE;
        }
        Ok(())
    }

    /// Returns whether the physical range is already reachable through an
    /// uncached block, so device registers there need no fresh mapping.
    pub fn dev_direct_mapped(&self, pa: Paddr, len: usize) -> bool {
        self.tlb1.covers_io(pa, len)
    }

    /// Makes a physical range addressable for the crash-dump writer and
    /// returns its virtual address.
    ///
    /// RAM is served by the direct map for free. Anything else is mapped
    /// through the dump sub-window, whose size bounds one chunk.
    pub fn dumpsys_map(&self, pa: Paddr, len: usize) -> Result<Vaddr> {
        if len == 0 {
            return Err(Error::InvalidArgs);
        }
        let offset = pa & (PAGE_SIZE - 1);
        let base = pa - offset;
        let end = pa
            .checked_add(len)
            .and_then(|e| e.checked_add(PAGE_SIZE - 1))
            .ok_or(Error::InvalidArgs)?
            & !(PAGE_SIZE - 1);
        let alen = end - base;

        let mut all_ram = true;
        let mut page = base;
        while page < end {
            if !self.phys.is_ram(page) {
                all_ram = false;
                break;
            }
            page += PAGE_SIZE;
        }
        if all_ram {
            if let Some(va) = self.phys.dmap_va(base) {
                return Ok(va + offset);
            }
        }

        let window = &self.config.dump_window;
        if alen > window.end - window.start {
            return Err(Error::InvalidArgs);
        }
        for i in (0..alen).step_by(PAGE_SIZE) {
            self.kenter_prot(window.start + i, base + i, MemAttr::normal(), Access::all())?;
        }
        Ok(window.start + offset)
    }

    /// Releases a [`Mmu::dumpsys_map`] chunk.
    ///
    /// Direct-map addresses need no teardown.
    pub fn dumpsys_unmap(&self, va: Vaddr, len: usize) {
        if self.config.dmap_range().contains(&va) {
            return;
        }
        if !self.config.dump_window.contains(&va) {
            return;
        }
        let base = va & !(PAGE_SIZE - 1);
        let end = va
            .saturating_add(len)
            .saturating_add(PAGE_SIZE - 1)
            & !(PAGE_SIZE - 1);
        let end = end.min(self.config.dump_window.end);
        let mut page = base;
        while page < end {
            self.kremove(page);
            page += PAGE_SIZE;
        }
    }

    /// Returns whether the reverse-map pool has crossed its pressure mark.
    ///
    /// The pager uses this to start evicting instead of mapping more.
    pub fn pv_pressure(&self) -> bool {
        self.pv.read().under_pressure()
    }

    /// The number of table pages currently allocated across all spaces.
    pub fn table_pages_in_use(&self) -> usize {
        self.budget.in_use()
    }

    /// Logs a summary of the translation state at debug level.
    pub fn log_state(&self) {
        log::debug!(
            "[mmu] {} table pages, {} pv entries, kernel resident {}",
            self.budget.in_use(),
            self.pv.read().nr_used(),
            self.kernel.resident_pages(),
        );
        self.tlb1.log_slots();
    }

    /// An executable mapping of RAM must see stores that built its
    /// contents; unreachable frames (no direct map) are the embedder's
    /// problem by then.
    fn sync_icache_for_enter(&self, access: Access, pa: Paddr) {
        if access.contains(Access::EXECUTE) {
            if let Some(va) = self.phys.dmap_va(pa) {
                self.machine.sync_icache(va, PAGE_SIZE);
            }
        }
    }

    /// Tears down the bookkeeping of one removed entry: the reverse-map
    /// link, the folded dirty bit, the space statistics, the stale TLB0
    /// translation.
    fn finish_teardown(
        &self,
        pv: &mut PvInner<S>,
        space: &Arc<AddressSpace<S>>,
        va: Vaddr,
        old: Pte,
    ) {
        if old.is_managed() {
            if let Some(record) = self.phys.record(old.pa()) {
                if old.is_modified() {
                    record.mark_dirty();
                }
            }
            if let Some(frame) = self.phys.frame_index(old.pa()) {
                pv.remove(frame, space, va);
            }
        } else if old.is_tracked() {
            if let Some(frame) = self.phys.frame_index(old.pa()) {
                pv.remove(frame, space, va);
                if pv.entries(frame).next().is_none() {
                    if let Some(record) = self.phys.record(old.pa()) {
                        record.set_tracked(false);
                    }
                }
            }
        }
        space.note_unmapped(old.is_wired());
        self.tlb0.flush_page(self.machine.as_ref(), va);
    }

    /// The shared body of the kernel-window mapping operations.
    fn kenter_prot(&self, va: Vaddr, pa: Paddr, attr: MemAttr, access: Access) -> Result<()> {
        if !crate::is_page_aligned(va) || !crate::is_page_aligned(pa) || !attr.is_valid() {
            return Err(Error::InvalidArgs);
        }
        if !self.config.kernel_window.contains(&va) {
            return Err(Error::InvalidArgs);
        }
        let flags = PteFlags::VALID | PteFlags::WIRED | access_flags(access, false);
        let pte = Pte::new(pa, attr, flags);

        let mut tree = self.kernel.tree();
        if tree.lookup(va).is_some() {
            tree.replace(va, pte);
            self.tlb0.flush_page(self.machine.as_ref(), va);
        } else {
            // The window's nodes were built at bootstrap, so this never
            // allocates.
            tree.install(va, pte)?;
        }
        Ok(())
    }

    /// Checks that `[va, va + len)` sits inside the kernel window.
    fn check_window_range(&self, va: Vaddr, len: usize) -> Result<()> {
        let window = &self.config.kernel_window;
        let end = va.checked_add(len).ok_or(Error::InvalidArgs)?;
        if !window.contains(&va) || end > window.end {
            return Err(Error::InvalidArgs);
        }
        Ok(())
    }

    fn check_user_range(
        &self,
        space: &Arc<AddressSpace<S>>,
        range: &Range<Vaddr>,
    ) -> Result<()> {
        if space.is_kernel() {
            return Err(Error::InvalidArgs);
        }
        if !crate::is_page_aligned(range.start)
            || !crate::is_page_aligned(range.end)
            || range.start > range.end
            || range.end > span::<S>()
        {
            return Err(Error::InvalidArgs);
        }
        Ok(())
    }
}

impl<S: PagingScheme> Drop for Mmu<S> {
    /// Clears every mapping still in the reverse map, so the spaces it
    /// keeps alive are released with no pages resident.
    fn drop(&mut self) {
        let mut pv = self.pv.write();
        for frame in 0..self.phys.nr_frames() {
            self.drain_frame(&mut pv, frame);
        }
    }
}
