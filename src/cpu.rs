// SPDX-License-Identifier: MPL-2.0

//! CPU identity and CPU sets.

use core::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

/// The ID of a CPU in the system.
///
/// IDs are dense and start at zero; the boot CPU is CPU 0. The embedder's
/// [`Machine`](crate::Machine) implementation is responsible for reporting
/// IDs below the configured CPU count.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(u32);

impl CpuId {
    /// The ID of the bootstrap CPU.
    pub const fn bsp() -> Self {
        CpuId(0)
    }

    /// Creates a CPU ID from a raw index.
    pub const fn new(index: usize) -> Self {
        CpuId(index as u32)
    }

    /// Converts the CPU ID to an index.
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

type InnerPart = u64;

const BITS_PER_PART: usize = InnerPart::BITS as usize;
const NR_PARTS_NO_ALLOC: usize = 2;

const fn part_idx(cpu_id: CpuId) -> usize {
    cpu_id.as_usize() / BITS_PER_PART
}

const fn bit_idx(cpu_id: CpuId) -> usize {
    cpu_id.as_usize() % BITS_PER_PART
}

/// A subset of all CPUs in the system.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuSet {
    bits: SmallVec<[InnerPart; NR_PARTS_NO_ALLOC]>,
}

impl CpuSet {
    /// Creates a new `CpuSet` containing no CPUs.
    pub fn new_empty() -> Self {
        Self {
            bits: SmallVec::new(),
        }
    }

    /// Creates a new `CpuSet` containing CPUs `0..nr_cpus`.
    pub fn new_full(nr_cpus: usize) -> Self {
        let mut set = Self::new_empty();
        for i in 0..nr_cpus {
            set.add(CpuId::new(i));
        }
        set
    }

    /// Adds a CPU to the set.
    pub fn add(&mut self, cpu_id: CpuId) {
        let part_idx = part_idx(cpu_id);
        let bit_idx = bit_idx(cpu_id);
        if part_idx >= self.bits.len() {
            self.bits.resize(part_idx + 1, 0);
        }
        self.bits[part_idx] |= 1 << bit_idx;
    }

    /// Removes a CPU from the set.
    pub fn remove(&mut self, cpu_id: CpuId) {
        let part_idx = part_idx(cpu_id);
        let bit_idx = bit_idx(cpu_id);
        if part_idx < self.bits.len() {
            self.bits[part_idx] &= !(1 << bit_idx);
        }
    }

    /// Returns true if the set contains the specified CPU.
    pub fn contains(&self, cpu_id: CpuId) -> bool {
        let part_idx = part_idx(cpu_id);
        let bit_idx = bit_idx(cpu_id);
        part_idx < self.bits.len() && (self.bits[part_idx] & (1 << bit_idx)) != 0
    }

    /// Returns the number of CPUs in the set.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|part| part.count_ones() as usize).sum()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|part| *part == 0)
    }

    /// Iterates over the CPUs in the set in ascending ID order.
    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.bits.iter().enumerate().flat_map(|(part_idx, &part)| {
            (0..BITS_PER_PART).filter_map(move |bit_idx| {
                if (part & (1 << bit_idx)) != 0 {
                    Some(CpuId::new(part_idx * BITS_PER_PART + bit_idx))
                } else {
                    None
                }
            })
        })
    }
}

/// A subset of all CPUs in the system with atomic operations.
///
/// Per-CPU membership updates are atomic; whole-set loads are not, and may
/// observe a mix of concurrent updates.
#[derive(Debug)]
pub struct AtomicCpuSet {
    bits: SmallVec<[AtomicU64; NR_PARTS_NO_ALLOC]>,
}

impl AtomicCpuSet {
    /// Creates a new `AtomicCpuSet` sized for `nr_cpus` CPUs, all absent.
    pub fn new_empty(nr_cpus: usize) -> Self {
        let nr_parts = nr_cpus.div_ceil(BITS_PER_PART);
        let mut bits = SmallVec::with_capacity(nr_parts);
        for _ in 0..nr_parts {
            bits.push(AtomicU64::new(0));
        }
        Self { bits }
    }

    /// Loads the current membership as a plain [`CpuSet`].
    pub fn load(&self) -> CpuSet {
        let bits = self
            .bits
            .iter()
            .map(|part| part.load(Ordering::Relaxed))
            .collect();
        CpuSet { bits }
    }

    /// Atomically adds a CPU.
    pub fn add(&self, cpu_id: CpuId) {
        let part_idx = part_idx(cpu_id);
        let bit_idx = bit_idx(cpu_id);
        if part_idx < self.bits.len() {
            self.bits[part_idx].fetch_or(1 << bit_idx, Ordering::Relaxed);
        }
    }

    /// Atomically removes a CPU.
    pub fn remove(&self, cpu_id: CpuId) {
        let part_idx = part_idx(cpu_id);
        let bit_idx = bit_idx(cpu_id);
        if part_idx < self.bits.len() {
            self.bits[part_idx].fetch_and(!(1 << bit_idx), Ordering::Relaxed);
        }
    }

    /// Atomically checks if the set contains the specified CPU.
    pub fn contains(&self, cpu_id: CpuId) -> bool {
        let part_idx = part_idx(cpu_id);
        let bit_idx = bit_idx(cpu_id);
        part_idx < self.bits.len()
            && (self.bits[part_idx].load(Ordering::Relaxed) & (1 << bit_idx)) != 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn full_set_contains_all() {
        let set = CpuSet::new_full(5);
        for i in 0..5 {
            assert!(set.contains(CpuId::new(i)));
        }
        assert!(!set.contains(CpuId::new(5)));
        assert_eq!(set.count(), 5);
    }

    #[test]
    fn empty_set_iter_is_empty() {
        let set = CpuSet::new_empty();
        assert!(set.iter().next().is_none());
        assert!(set.is_empty());
    }

    #[test]
    fn atomic_set_add_remove() {
        let set = AtomicCpuSet::new_empty(4);
        set.add(CpuId::new(2));
        assert!(set.contains(CpuId::new(2)));
        assert!(!set.contains(CpuId::new(1)));
        set.remove(CpuId::new(2));
        assert!(set.load().is_empty());
    }
}
