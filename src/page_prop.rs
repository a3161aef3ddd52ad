// SPDX-License-Identifier: MPL-2.0

//! Mapping rights, cache attributes, and mapping-request flags.

use bitflags::bitflags;

bitflags! {
    /// The access rights requested for (or granted by) a mapping.
    ///
    /// Rights are interpreted relative to the address space they apply to:
    /// the privileged space yields supervisor-only leaf entries, user spaces
    /// yield both supervisor and user bits so the kernel can reach the
    /// mapping through the same translation.
    pub struct Access: u8 {
        /// Readable.
        const READ = 0b001;
        /// Writable.
        const WRITE = 0b010;
        /// Executable.
        const EXECUTE = 0b100;
    }
}

impl Access {
    /// Read and write.
    pub const RW: Access = Access::from_bits_truncate(0b011);
}

bitflags! {
    /// The WIMGE cache-attribute bit group carried by every translation.
    ///
    /// The combination of `WRITE_THROUGH` and `CACHE_INHIBIT` is
    /// architecturally undefined and rejected by validation.
    pub struct MemAttr: u8 {
        /// W: write-through rather than write-back.
        const WRITE_THROUGH = 1 << 0;
        /// I: caching inhibited.
        const CACHE_INHIBIT = 1 << 1;
        /// M: memory coherence required.
        const COHERENT = 1 << 2;
        /// G: guarded (no speculative access).
        const GUARDED = 1 << 3;
        /// E: little-endian access.
        const LITTLE_ENDIAN = 1 << 4;
    }
}

impl MemAttr {
    /// The attribute set for ordinary cacheable RAM.
    pub const fn normal() -> Self {
        MemAttr::COHERENT
    }

    /// The attribute set for device memory: uncached and guarded.
    pub const fn io() -> Self {
        MemAttr::from_bits_truncate(
            MemAttr::CACHE_INHIBIT.bits() | MemAttr::GUARDED.bits(),
        )
    }

    /// Returns whether the attribute combination is architecturally valid.
    pub fn is_valid(self) -> bool {
        !self.contains(MemAttr::WRITE_THROUGH | MemAttr::CACHE_INHIBIT)
    }

    /// Returns whether the attributes describe uncached (device) memory.
    pub fn is_io(self) -> bool {
        self.contains(MemAttr::CACHE_INHIBIT)
    }
}

impl Default for MemAttr {
    fn default() -> Self {
        MemAttr::normal()
    }
}

bitflags! {
    /// Modifier flags for [`Mmu::enter`].
    ///
    /// [`Mmu::enter`]: crate::mmu::Mmu::enter
    pub struct EnterFlags: u8 {
        /// The mapping is wired: exempt from pageout bookkeeping.
        const WIRED = 1 << 0;
        /// Fail with a resource-shortage error instead of waiting when a
        /// table page cannot be allocated.
        const NO_WAIT = 1 << 1;
        /// The page is not under pager control. No reverse-map entry is
        /// created and the page never collects referenced or dirty state.
        const UNMANAGED = 1 << 2;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn attr_validity() {
        assert!(MemAttr::normal().is_valid());
        assert!(MemAttr::io().is_valid());
        assert!(!(MemAttr::WRITE_THROUGH | MemAttr::CACHE_INHIBIT).is_valid());
        assert!(MemAttr::io().is_io());
        assert!(!MemAttr::normal().is_io());
    }
}
