// SPDX-License-Identifier: MPL-2.0

//! Address spaces.
//!
//! A space is one translation domain: a user process image, or the kernel.
//! It owns a translation tree and, per CPU, the hardware context id it was
//! last given there. Spaces are handled by reference count everywhere; the
//! reverse map holds strong references, so a space stays alive until its
//! last managed page is unmapped.
//!
//! All meaningful mutation goes through [`Mmu`](crate::mmu::Mmu) methods,
//! which take the space's lock after the reverse-map lock and before the
//! TLB0 invalidate lock.

use core::sync::atomic::{AtomicU16, AtomicUsize, Ordering};

use spin::{Mutex, MutexGuard};

use crate::{
    cpu::{AtomicCpuSet, CpuId, CpuSet},
    page_table::{PagingScheme, PtBudget, PtTree},
    prelude::*,
    tid::{Tid, TID_KERNEL, TID_NONE},
};

/// One translation domain.
pub struct AddressSpace<S: PagingScheme> {
    kernel: bool,
    tree: Mutex<PtTree<S>>,
    /// Per-CPU context-id binding, [`TID_NONE`] where unbound.
    contexts: Vec<AtomicU16>,
    active_on: AtomicCpuSet,
    resident: AtomicUsize,
    wired: AtomicUsize,
}

impl<S: PagingScheme> AddressSpace<S> {
    pub(crate) fn new_user(nr_cpus: usize, budget: Arc<PtBudget>) -> Result<Arc<Self>> {
        Self::new(false, 0, nr_cpus, TID_NONE, budget)
    }

    /// The kernel space: tree at the kernel base, permanently allocated
    /// nodes, the wildcard context id on every CPU.
    pub(crate) fn new_kernel(
        base: Vaddr,
        nr_cpus: usize,
        budget: Arc<PtBudget>,
    ) -> Result<Arc<Self>> {
        Self::new(true, base, nr_cpus, TID_KERNEL, budget)
    }

    fn new(
        kernel: bool,
        base: Vaddr,
        nr_cpus: usize,
        tid: Tid,
        budget: Arc<PtBudget>,
    ) -> Result<Arc<Self>> {
        let tree = PtTree::new(base, kernel, budget)?;
        let mut contexts = Vec::with_capacity(nr_cpus);
        contexts.resize_with(nr_cpus, || AtomicU16::new(tid));
        Ok(Arc::new(AddressSpace {
            kernel,
            tree: Mutex::new(tree),
            contexts,
            active_on: AtomicCpuSet::new_empty(nr_cpus),
            resident: AtomicUsize::new(0),
            wired: AtomicUsize::new(0),
        }))
    }

    /// Returns whether this is the kernel's space.
    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    /// The number of pages currently mapped, managed or not.
    pub fn resident_pages(&self) -> usize {
        self.resident.load(Ordering::Relaxed)
    }

    /// The number of mapped pages exempt from pageout.
    pub fn wired_pages(&self) -> usize {
        self.wired.load(Ordering::Relaxed)
    }

    /// The CPUs the space is activated on right now.
    pub fn active_cpus(&self) -> CpuSet {
        self.active_on.load()
    }

    pub(crate) fn mark_active(&self, cpu: CpuId) {
        self.active_on.add(cpu);
    }

    pub(crate) fn mark_inactive(&self, cpu: CpuId) {
        self.active_on.remove(cpu);
    }

    pub(crate) fn tree(&self) -> MutexGuard<'_, PtTree<S>> {
        self.tree.lock()
    }

    pub(crate) fn context_on(&self, cpu: CpuId) -> Tid {
        self.contexts[cpu.as_usize()].load(Ordering::Relaxed)
    }

    pub(crate) fn set_context_on(&self, cpu: CpuId, tid: Tid) {
        self.contexts[cpu.as_usize()].store(tid, Ordering::Relaxed);
    }

    pub(crate) fn note_mapped(&self, wired: bool) {
        self.resident.fetch_add(1, Ordering::Relaxed);
        if wired {
            self.wired.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn note_unmapped(&self, wired: bool) {
        self.resident.fetch_sub(1, Ordering::Relaxed);
        if wired {
            self.wired.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Adjusts the wired count when an existing mapping changes wiring
    /// without being torn down.
    pub(crate) fn note_wired_flip(&self, now_wired: bool) {
        if now_wired {
            self.wired.fetch_add(1, Ordering::Relaxed);
        } else {
            self.wired.fetch_sub(1, Ordering::Relaxed);
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(nr_cpus: usize) -> Arc<Self> {
        let budget = Arc::new(PtBudget::new(None));
        match Self::new_user(nr_cpus, budget) {
            Ok(space) => space,
            Err(_) => unreachable!("unbounded budget cannot fail"),
        }
    }
}

impl<S: PagingScheme> Drop for AddressSpace<S> {
    /// A space must be fully unmapped before its last reference goes.
    ///
    /// Managed mappings pin the space through the reverse map, so only an
    /// unmanaged leak can reach this with pages still resident.
    fn drop(&mut self) {
        debug_assert_eq!(
            self.resident_pages(),
            0,
            "address space dropped with resident mappings"
        );
    }
}
