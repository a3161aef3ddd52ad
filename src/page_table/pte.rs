// SPDX-License-Identifier: MPL-2.0

//! The leaf translation entry.
//!
//! One 64-bit word carries the physical page base, the WIMGE attributes,
//! the supervisor/user permission bits, and the state bits the pager and
//! the refill path care about. The same layout serves both paging schemes;
//! the physical field is wide enough for the 36-bit buses of the 32-bit
//! parts.

use core::ops::Range;

use bit_field::BitField;
use bitflags::bitflags;

use crate::{
    page_prop::{Access, MemAttr},
    Paddr, PAGE_SHIFT,
};

bitflags! {
    /// State and permission bits of a [`Pte`].
    pub(crate) struct PteFlags: u64 {
        /// The entry translates.
        const VALID = 1 << 0;
        /// Exempt from pageout bookkeeping.
        const WIRED = 1 << 1;
        /// The target page is under pager control and reverse-mapped.
        const MANAGED = 1 << 2;
        /// Set by the refill path on any permitted access.
        const REFERENCED = 1 << 3;
        /// Set by the refill path on a permitted write.
        const MODIFIED = 1 << 4;
        /// Unmanaged, but reverse-indexed for VA-to-PA lookup.
        const TRACKED = 1 << 10;
        /// Supervisor read.
        const SR = 1 << 52;
        /// Supervisor write.
        const SW = 1 << 53;
        /// Supervisor execute.
        const SX = 1 << 54;
        /// User read.
        const UR = 1 << 55;
        /// User write.
        const UW = 1 << 56;
        /// User execute.
        const UX = 1 << 57;
    }
}

const ATTR_RANGE: Range<usize> = 5..10;
const PFN_RANGE: Range<usize> = 12..52;

/// Builds the permission bits for a mapping request.
///
/// The supervisor bits always mirror the request so the kernel can reach
/// user mappings through the same translation; the user bits appear only
/// for user spaces.
pub(crate) fn access_flags(access: Access, user: bool) -> PteFlags {
    let mut flags = PteFlags::SR;
    if access.contains(Access::WRITE) {
        flags |= PteFlags::SW;
    }
    if access.contains(Access::EXECUTE) {
        flags |= PteFlags::SX;
    }
    if user {
        flags |= PteFlags::UR;
        if access.contains(Access::WRITE) {
            flags |= PteFlags::UW;
        }
        if access.contains(Access::EXECUTE) {
            flags |= PteFlags::UX;
        }
    }
    flags
}

/// A leaf translation entry.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pte(u64);

impl Pte {
    /// The invalid, all-zero entry.
    pub const EMPTY: Pte = Pte(0);

    pub fn new(pa: Paddr, attr: MemAttr, flags: PteFlags) -> Pte {
        debug_assert!(crate::is_page_aligned(pa));
        let mut raw = flags.bits();
        raw.set_bits(ATTR_RANGE, attr.bits() as u64);
        raw.set_bits(PFN_RANGE, (pa >> PAGE_SHIFT) as u64);
        Pte(raw)
    }

    pub const fn from_raw(raw: u64) -> Pte {
        Pte(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn pa(self) -> Paddr {
        (self.0.get_bits(PFN_RANGE) as Paddr) << PAGE_SHIFT
    }

    pub fn attr(self) -> MemAttr {
        MemAttr::from_bits_truncate(self.0.get_bits(ATTR_RANGE) as u8)
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    pub fn is_valid(self) -> bool {
        self.flags().contains(PteFlags::VALID)
    }

    pub fn is_wired(self) -> bool {
        self.flags().contains(PteFlags::WIRED)
    }

    pub fn is_managed(self) -> bool {
        self.flags().contains(PteFlags::MANAGED)
    }

    pub fn is_referenced(self) -> bool {
        self.flags().contains(PteFlags::REFERENCED)
    }

    pub fn is_modified(self) -> bool {
        self.flags().contains(PteFlags::MODIFIED)
    }

    pub fn is_tracked(self) -> bool {
        self.flags().contains(PteFlags::TRACKED)
    }

    pub fn cleared(self, flags: PteFlags) -> Pte {
        Pte(self.0 & !flags.bits())
    }

    pub fn with(self, flags: PteFlags) -> Pte {
        Pte(self.0 | flags.bits())
    }

    /// The rights the entry grants to supervisor accesses.
    pub fn sup_access(self) -> Access {
        let f = self.flags();
        let mut a = Access::empty();
        if f.contains(PteFlags::SR) {
            a |= Access::READ;
        }
        if f.contains(PteFlags::SW) {
            a |= Access::WRITE;
        }
        if f.contains(PteFlags::SX) {
            a |= Access::EXECUTE;
        }
        a
    }

    /// The rights the entry grants to user accesses.
    pub fn user_access(self) -> Access {
        let f = self.flags();
        let mut a = Access::empty();
        if f.contains(PteFlags::UR) {
            a |= Access::READ;
        }
        if f.contains(PteFlags::UW) {
            a |= Access::WRITE;
        }
        if f.contains(PteFlags::UX) {
            a |= Access::EXECUTE;
        }
        a
    }

    /// Returns whether the entry permits `access` at the given privilege.
    pub fn grants(self, access: Access, user: bool) -> bool {
        let granted = if user {
            self.user_access()
        } else {
            self.sup_access()
        };
        granted.contains(access)
    }
}

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pte")
            .field("pa", &self.pa())
            .field("flags", &self.flags())
            .field("attr", &self.attr())
            .finish()
    }
}
