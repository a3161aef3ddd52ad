// SPDX-License-Identifier: MPL-2.0

//! The seam between this crate and the hardware.
//!
//! Everything privileged lives behind [`Machine`]: the context-id register,
//! the TLB invalidate instruction sequences, the TLB1 slot array, and the
//! all-core rendezvous the crate uses to keep TLB1 identical on every CPU.
//! The crate contains no target code of its own; the embedder implements
//! this trait once per platform.

use crate::{cpu::CpuId, tid::Tid, tlb1::Tlb1Entry, Vaddr};

/// Raw hardware operations consumed by the translation core.
///
/// Implementations must be callable from any CPU. The per-CPU operations
/// (`set_context`, `tlb0_flush_context`, `tlb1_read`, `tlb1_write`) act on
/// the calling CPU's MMU only.
pub trait Machine: Send + Sync {
    /// Returns the ID of the calling CPU.
    fn current_cpu(&self) -> CpuId;

    /// Writes the calling CPU's context-id (PID) register.
    fn set_context(&self, tid: Tid);

    /// Runs the address-qualified TLB0 invalidate sequence for `va`.
    ///
    /// The hardware broadcasts the invalidation to every CPU in the
    /// coherence domain and matches the address regardless of context id.
    /// The caller serializes invocations; two CPUs never run the sequence
    /// concurrently.
    fn tlb0_flush_page(&self, va: Vaddr);

    /// Invalidates every TLB0 entry of context `tid` on the calling CPU.
    ///
    /// Other CPUs are unaffected.
    fn tlb0_flush_context(&self, tid: Tid);

    /// Reads TLB1 slot `slot` on the calling CPU.
    fn tlb1_read(&self, slot: usize) -> Tlb1Entry;

    /// Programs TLB1 slot `slot` on the calling CPU.
    ///
    /// There is no hardware broadcast for TLB1; keeping the slot array
    /// identical across CPUs is the caller's job (see [`Machine::broadcast`]).
    fn tlb1_write(&self, slot: usize, entry: Tlb1Entry);

    /// Stops the world and runs `f` once on every CPU, including the caller.
    ///
    /// Returns only after every CPU has finished running `f`. While the
    /// rendezvous is in progress no CPU executes anything else, so `f` may
    /// rewrite translation state that other CPUs would otherwise be using.
    ///
    /// Callers may hold spinlocks across this call; implementations must
    /// deliver `f` through a mechanism (interrupt, doorbell, polling slot)
    /// that does not require the target CPUs to take those locks.
    fn broadcast(&self, f: &(dyn Fn() + Sync));

    /// Zeroes `len` bytes of memory at the mapped address `va`.
    ///
    /// `va` is always a kernel address with a live translation (typically a
    /// direct-map address), so the operation cannot fault.
    fn zero(&self, va: Vaddr, len: usize);

    /// Copies `len` bytes between the mapped addresses `src` and `dst`.
    fn copy(&self, dst: Vaddr, src: Vaddr, len: usize);

    /// Makes the instruction cache coherent with `len` bytes of data at the
    /// mapped address `va`.
    fn sync_icache(&self, va: Vaddr, len: usize);
}
