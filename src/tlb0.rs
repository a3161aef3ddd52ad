// SPDX-License-Identifier: MPL-2.0

//! TLB0 shootdown.
//!
//! TLB0 is refilled by the miss handler and never enumerated; the crate
//! keeps no copy of its contents. The only obligation is to drop entries
//! that stopped matching the page tables. The address-qualified invalidate
//! broadcasts in hardware and matches on the address alone, reaching every
//! context id on every CPU, but the instruction sequence must not run on
//! two CPUs concurrently. The lock here serializes it and nothing else, so
//! it nests inside every other lock in the crate.

use spin::Mutex;

use crate::{
    machine::Machine,
    tid::{Tid, TID_KERNEL},
    Vaddr,
};

pub(crate) struct Tlb0 {
    invalidate_lock: Mutex<()>,
}

impl Tlb0 {
    pub fn new() -> Self {
        Tlb0 {
            invalidate_lock: Mutex::new(()),
        }
    }

    /// Drops the translation of `va` from every CPU's TLB0.
    pub fn flush_page(&self, machine: &dyn Machine, va: Vaddr) {
        let _guard = self.invalidate_lock.lock();
        machine.tlb0_flush_page(va);
    }

    /// Drops every translation tagged `tid` from the calling CPU's TLB0.
    ///
    /// Purely local; other CPUs keep whatever they cached under the id
    /// until their own banks recycle it.
    pub fn flush_context(&self, machine: &dyn Machine, tid: Tid) {
        // The wildcard id backs the kernel's permanent translations and is
        // never recycled.
        debug_assert_ne!(tid, TID_KERNEL);
        machine.tlb0_flush_context(tid);
    }
}
