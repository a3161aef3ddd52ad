// SPDX-License-Identifier: MPL-2.0

//! A software stand-in for the hardware seam, used by tests.
//!
//! Models exactly what the crate relies on: one context register and one
//! TLB1 slot array per CPU, a single-threaded rendezvous, and an ordered
//! log of the operations that leave no other observable trace.

use core::sync::atomic::{AtomicU16, AtomicUsize, Ordering};

use spin::Mutex;

use crate::{
    cpu::CpuId,
    machine::Machine,
    prelude::*,
    tid::{Tid, TID_KERNEL},
    tlb1::Tlb1Entry,
};

/// One recorded hardware operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    SetContext(CpuId, Tid),
    FlushPage(CpuId, Vaddr),
    FlushContext(CpuId, Tid),
    Zero(Vaddr, usize),
    Copy(Vaddr, Vaddr, usize),
    SyncIcache(Vaddr, usize),
}

/// The fake machine. Tests pick which CPU the calling thread pretends to
/// be with [`SoftMachine::set_current_cpu`].
pub(crate) struct SoftMachine {
    current: AtomicUsize,
    contexts: Vec<AtomicU16>,
    tlb1: Vec<Mutex<[Tlb1Entry; 64]>>,
    events: Mutex<Vec<Event>>,
}

impl SoftMachine {
    pub fn new(nr_cpus: usize) -> Self {
        let mut contexts = Vec::with_capacity(nr_cpus);
        contexts.resize_with(nr_cpus, || AtomicU16::new(TID_KERNEL));
        let mut tlb1 = Vec::with_capacity(nr_cpus);
        tlb1.resize_with(nr_cpus, || Mutex::new([Tlb1Entry::INVALID; 64]));
        SoftMachine {
            current: AtomicUsize::new(0),
            contexts,
            tlb1,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn set_current_cpu(&self, cpu: CpuId) {
        self.current.store(cpu.as_usize(), Ordering::Relaxed);
    }

    /// The context register of `cpu`.
    pub fn context(&self, cpu: CpuId) -> Tid {
        self.contexts[cpu.as_usize()].load(Ordering::Relaxed)
    }

    /// The contents of one TLB1 slot on `cpu`.
    pub fn tlb1_slot(&self, cpu: CpuId, slot: usize) -> Tlb1Entry {
        self.tlb1[cpu.as_usize()].lock()[slot]
    }

    /// Drains the event log.
    pub fn take_events(&self) -> Vec<Event> {
        core::mem::take(&mut *self.events.lock())
    }

    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl Machine for SoftMachine {
    fn current_cpu(&self) -> CpuId {
        CpuId::new(self.current.load(Ordering::Relaxed))
    }

    fn set_context(&self, tid: Tid) {
        let cpu = self.current_cpu();
        self.contexts[cpu.as_usize()].store(tid, Ordering::Relaxed);
        self.record(Event::SetContext(cpu, tid));
    }

    fn tlb0_flush_page(&self, va: Vaddr) {
        self.record(Event::FlushPage(self.current_cpu(), va));
    }

    fn tlb0_flush_context(&self, tid: Tid) {
        self.record(Event::FlushContext(self.current_cpu(), tid));
    }

    fn tlb1_read(&self, slot: usize) -> Tlb1Entry {
        self.tlb1[self.current_cpu().as_usize()].lock()[slot]
    }

    fn tlb1_write(&self, slot: usize, entry: Tlb1Entry) {
        self.tlb1[self.current_cpu().as_usize()].lock()[slot] = entry;
    }

    fn broadcast(&self, f: &(dyn Fn() + Sync)) {
        let home = self.current.load(Ordering::Relaxed);
        for cpu in 0..self.tlb1.len() {
            self.current.store(cpu, Ordering::Relaxed);
            f();
        }
        self.current.store(home, Ordering::Relaxed);
    }

    fn zero(&self, va: Vaddr, len: usize) {
        self.record(Event::Zero(va, len));
    }

    fn copy(&self, dst: Vaddr, src: Vaddr, len: usize) {
        self.record(Event::Copy(dst, src, len));
    }

    fn sync_icache(&self, va: Vaddr, len: usize) {
        self.record(Event::SyncIcache(va, len));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn broadcast_visits_every_cpu_and_returns_home() {
        let machine = SoftMachine::new(3);
        machine.set_current_cpu(CpuId::new(2));
        let visited = Mutex::new(Vec::new());
        machine.broadcast(&|| visited.lock().push(machine.current_cpu().as_usize()));
        assert_eq!(*visited.lock(), [0, 1, 2]);
        assert_eq!(machine.current_cpu(), CpuId::new(2));
    }
}
