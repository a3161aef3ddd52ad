// SPDX-License-Identifier: MPL-2.0

//! Translation management for Book-E class MMUs.
//!
//! The hardware model is a software-managed, two-tier TLB: TLB0 is a
//! set-associative cache refilled by a software miss handler and never
//! enumerated, TLB1 is a small array of explicitly programmed, variable-size
//! entries that back the kernel image, the direct physical map, and device
//! windows. This crate keeps the in-memory page-table trees, the reverse-map
//! index, the TLB1 slot array, and the per-CPU context-id bindings mutually
//! consistent across cores.
//!
//! All hardware access is funneled through the [`Machine`] trait, so the
//! crate itself is target-neutral. [`Mmu::bootstrap`] builds the root object
//! from a [`boot::BootConfig`]; everything else hangs off [`Mmu`] and the
//! [`AddressSpace`] objects it creates.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![allow(clippy::len_without_is_empty)]

extern crate alloc;

pub mod boot;
pub mod cpu;
mod error;
pub mod machine;
pub mod mmu;
pub mod page_prop;
pub mod page_table;
pub(crate) mod phys;
pub mod prelude;
pub(crate) mod pv;
pub mod space;
pub mod tid;
pub(crate) mod tlb0;
pub mod tlb1;

#[cfg(test)]
pub(crate) mod soft;

pub use self::{
    error::Error,
    machine::Machine,
    mmu::{Mmu, RefillEntry},
    prelude::Result,
    space::AddressSpace,
};

/// A virtual address.
pub type Vaddr = usize;

/// A physical address.
///
/// Pointer-sized. Parts whose physical bus is wider than the virtual
/// address (the 36-bit buses of some 32-bit cores) are served only up to
/// the pointer width.
pub type Paddr = usize;

/// The smallest translation granule.
pub const PAGE_SIZE: usize = 4096;

/// Log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;

/// Returns whether the address is aligned to the translation granule.
pub const fn is_page_aligned(addr: usize) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}
