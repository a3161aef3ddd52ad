// SPDX-License-Identifier: MPL-2.0

//! Hardware context-id management.
//!
//! TLB0 entries are tagged with the context id (PID) that was live when the
//! miss handler wrote them. Each CPU hands out ids from its own bank, so a
//! space running on two CPUs holds two independent ids. Allocation is a
//! plain rotation: the cursor's current holder, if any, is evicted on the
//! spot. There is no free list and no search, which bounds every activation
//! at one context flush no matter how many spaces exist.

use crate::{
    cpu::CpuId, machine::Machine, page_table::PagingScheme, prelude::*, space::AddressSpace,
    tlb0::Tlb0,
};

/// A hardware context id, the value of the PID register that tags TLB0
/// entries.
pub type Tid = u16;

/// The privileged wildcard id.
///
/// Entries tagged with it match accesses under every context id, so it is
/// pinned to the kernel and never allocated to a space.
pub const TID_KERNEL: Tid = 0;

/// Marks an unbound per-CPU context slot of a space.
pub(crate) const TID_NONE: Tid = Tid::MAX;

/// The first allocatable id.
pub(crate) const TID_MIN: Tid = 1;

/// One CPU's context-id allocator.
pub(crate) struct ContextBank<S: PagingScheme> {
    cpu: CpuId,
    next: Tid,
    limit: Tid,
    owners: Vec<Option<Weak<AddressSpace<S>>>>,
}

impl<S: PagingScheme> ContextBank<S> {
    pub fn new(cpu: CpuId, limit: Tid) -> Self {
        debug_assert!(limit > TID_MIN);
        let mut owners = Vec::new();
        owners.resize_with(limit as usize, || None);
        ContextBank {
            cpu,
            next: TID_MIN,
            limit,
            owners,
        }
    }

    /// Binds a fresh id of this CPU to `space` and returns it.
    ///
    /// Must run on the bank's CPU: the eviction flush acts on the local
    /// TLB0 only.
    pub fn alloc(
        &mut self,
        machine: &dyn Machine,
        tlb0: &Tlb0,
        space: &Arc<AddressSpace<S>>,
    ) -> Tid {
        debug_assert_eq!(machine.current_cpu(), self.cpu);

        let tid = self.next;
        self.next = if tid + 1 == self.limit { TID_MIN } else { tid + 1 };

        if let Some(owner) = self.owners[tid as usize].take() {
            // Entries tagged with the id are still in this CPU's TLB0
            // whether or not the previous owner is still alive.
            tlb0.flush_context(machine, tid);
            if let Some(victim) = owner.upgrade() {
                victim.set_context_on(self.cpu, TID_NONE);
            }
            log::debug!(
                "[tid] cpu {} recycles context {}",
                self.cpu.as_usize(),
                tid
            );
        }

        self.owners[tid as usize] = Some(Arc::downgrade(space));
        space.set_context_on(self.cpu, tid);
        tid
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{page_table::Booke64, soft::SoftMachine, space::AddressSpace};

    #[test]
    fn rotation_reuses_oldest_id_first() {
        let machine = SoftMachine::new(1);
        let tlb0 = Tlb0::new();
        let mut bank = ContextBank::<Booke64>::new(CpuId::bsp(), 4);
        let spaces: Vec<_> = (0..5).map(|_| AddressSpace::for_test(1)).collect();

        // Ids 1..4 rotate; the fourth allocation wraps and steals id 1.
        assert_eq!(bank.alloc(&machine, &tlb0, &spaces[0]), 1);
        assert_eq!(bank.alloc(&machine, &tlb0, &spaces[1]), 2);
        assert_eq!(bank.alloc(&machine, &tlb0, &spaces[2]), 3);
        assert_eq!(bank.alloc(&machine, &tlb0, &spaces[3]), 1);
        assert_eq!(bank.alloc(&machine, &tlb0, &spaces[4]), 2);
    }

    #[test]
    fn stealing_unbinds_the_victim() {
        let machine = SoftMachine::new(1);
        let tlb0 = Tlb0::new();
        let mut bank = ContextBank::<Booke64>::new(CpuId::bsp(), 2);
        let first = AddressSpace::<Booke64>::for_test(1);
        let second = AddressSpace::<Booke64>::for_test(1);

        // With two ids total only id 1 is allocatable, so the second
        // allocation must steal it back.
        assert_eq!(bank.alloc(&machine, &tlb0, &first), 1);
        assert_eq!(first.context_on(CpuId::bsp()), 1);
        assert_eq!(bank.alloc(&machine, &tlb0, &second), 1);
        assert_eq!(first.context_on(CpuId::bsp()), TID_NONE);
        assert_eq!(second.context_on(CpuId::bsp()), 1);
    }

    #[test]
    fn dead_owners_do_not_block_reuse() {
        let machine = SoftMachine::new(1);
        let tlb0 = Tlb0::new();
        let mut bank = ContextBank::<Booke64>::new(CpuId::bsp(), 2);
        {
            let doomed = AddressSpace::<Booke64>::for_test(1);
            bank.alloc(&machine, &tlb0, &doomed);
        }
        let space = AddressSpace::<Booke64>::for_test(1);
        assert_eq!(bank.alloc(&machine, &tlb0, &space), 1);
    }

    #[test]
    fn kernel_id_is_never_allocated() {
        let machine = SoftMachine::new(1);
        let tlb0 = Tlb0::new();
        let mut bank = ContextBank::<Booke64>::new(CpuId::bsp(), 3);
        let space = AddressSpace::<Booke64>::for_test(1);
        for _ in 0..16 {
            assert_ne!(bank.alloc(&machine, &tlb0, &space), TID_KERNEL);
        }
    }
}
