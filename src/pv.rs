// SPDX-License-Identifier: MPL-2.0

//! The reverse map.
//!
//! Every managed mapping is indexed twice: forward in its space's tree and
//! backward here, from the frame to each (space, address) pair mapping it.
//! The index is a single pool of entries linked by `u32` indexes with one
//! list head per frame, all behind one reader-writer lock. Page-centric
//! queries take it shared; anything adding or removing mappings takes it
//! exclusive. The lock orders before every address-space lock.
//!
//! Entries hold strong references to their space, so a space with resident
//! managed pages cannot disappear under a page-centric walk.

use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{error::Error, page_table::PagingScheme, prelude::*, space::AddressSpace};

const NO_PV: u32 = u32::MAX;

struct PvEntry<S: PagingScheme> {
    space: Arc<AddressSpace<S>>,
    va: Vaddr,
    next: u32,
}

enum PvSlot<S: PagingScheme> {
    Free { next: u32 },
    Used(PvEntry<S>),
}

pub(crate) struct PvInner<S: PagingScheme> {
    slab: Vec<PvSlot<S>>,
    free_head: u32,
    heads: Vec<u32>,
    nr_used: usize,
    limit: Option<usize>,
    high_water: usize,
}

/// The lock around the whole reverse map.
pub(crate) struct PvIndex<S: PagingScheme> {
    inner: RwLock<PvInner<S>>,
}

impl<S: PagingScheme> PvIndex<S> {
    pub fn new(nr_frames: usize, limit: Option<usize>, high_water: usize) -> Self {
        PvIndex {
            inner: RwLock::new(PvInner {
                slab: Vec::new(),
                free_head: NO_PV,
                heads: alloc::vec![NO_PV; nr_frames],
                nr_used: 0,
                limit,
                high_water,
            }),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, PvInner<S>> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, PvInner<S>> {
        self.inner.write()
    }
}

impl<S: PagingScheme> PvInner<S> {
    /// Links (`space`, `va`) onto `frame`'s list.
    ///
    /// Fails with [`Error::NoMemory`] when the configured pool limit is
    /// reached, leaving the index unchanged.
    pub fn insert(&mut self, frame: usize, space: &Arc<AddressSpace<S>>, va: Vaddr) -> Result<()> {
        if self.limit.is_some_and(|limit| self.nr_used >= limit) {
            log::debug!("[pv] entry pool exhausted at {} entries", self.nr_used);
            return Err(Error::NoMemory);
        }
        let entry = PvEntry {
            space: space.clone(),
            va,
            next: self.heads[frame],
        };
        let slot = if self.free_head != NO_PV {
            let slot = self.free_head;
            let PvSlot::Free { next } = self.slab[slot as usize] else {
                panic!("reverse-map free list corrupted");
            };
            self.free_head = next;
            self.slab[slot as usize] = PvSlot::Used(entry);
            slot
        } else {
            let slot = self.slab.len() as u32;
            self.slab.push(PvSlot::Used(entry));
            slot
        };
        self.heads[frame] = slot;
        self.nr_used += 1;
        if self.nr_used == self.high_water {
            log::debug!("[pv] {} entries in use, pool under pressure", self.nr_used);
        }
        Ok(())
    }

    /// Unlinks the entry for (`space`, `va`) from `frame`'s list.
    ///
    /// The entry must exist; a miss means the forward and reverse maps
    /// disagree, which is fatal.
    pub fn remove(&mut self, frame: usize, space: &Arc<AddressSpace<S>>, va: Vaddr) {
        let mut prev = NO_PV;
        let mut cursor = self.heads[frame];
        while cursor != NO_PV {
            let (matches, next) = {
                let PvSlot::Used(entry) = &self.slab[cursor as usize] else {
                    panic!("reverse-map chain corrupted");
                };
                (
                    entry.va == va && Arc::ptr_eq(&entry.space, space),
                    entry.next,
                )
            };
            if matches {
                if prev == NO_PV {
                    self.heads[frame] = next;
                } else {
                    let PvSlot::Used(before) = &mut self.slab[prev as usize] else {
                        panic!("reverse-map chain corrupted");
                    };
                    before.next = next;
                }
                self.slab[cursor as usize] = PvSlot::Free {
                    next: self.free_head,
                };
                self.free_head = cursor;
                self.nr_used -= 1;
                return;
            }
            prev = cursor;
            cursor = next;
        }
        panic!("no reverse-map entry for {va:#x}");
    }

    /// Walks `frame`'s list front to back.
    pub fn entries(&self, frame: usize) -> PvIter<'_, S> {
        PvIter {
            inner: self,
            cursor: self.heads[frame],
        }
    }

    pub fn nr_used(&self) -> usize {
        self.nr_used
    }

    /// Whether the pool crossed the configured pressure mark.
    pub fn under_pressure(&self) -> bool {
        self.nr_used >= self.high_water
    }
}

pub(crate) struct PvIter<'a, S: PagingScheme> {
    inner: &'a PvInner<S>,
    cursor: u32,
}

impl<'a, S: PagingScheme> Iterator for PvIter<'a, S> {
    type Item = (&'a Arc<AddressSpace<S>>, Vaddr);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NO_PV {
            return None;
        }
        let PvSlot::Used(entry) = &self.inner.slab[self.cursor as usize] else {
            panic!("reverse-map chain corrupted");
        };
        self.cursor = entry.next;
        Some((&entry.space, entry.va))
    }
}
