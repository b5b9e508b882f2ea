//! Operations over every mapping of a frame.
//!
//! Each walks a snapshot of the frame's reverse mappings taken under the
//! frame lock and then visits the mappers one at a time under their space
//! lock, so the frame lock is never held while a space lock is taken.

use super::MemoryManager;
use super::mapping::Released;
use crate::pfn::Pfn;
use crate::rmap::Mapper;
use crate::space::{AddressSpace, AddressSpaceId};
use alloc::vec::Vec;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{PageTableEntry, PhysMapper, invalidate_tlb_page};
use log::{debug, trace};

/// Spare rmap nodes kept on top of what a caller asks for, so that
/// concurrent inserts between a reservation and its use still fit.
const RMAP_HEADROOM: usize = 64;

impl<M: PhysMapper> MemoryManager<M> {
    /// Record an extra mapper of `pfn` that was installed outside
    /// [`create_mapping`](Self::create_mapping).
    pub fn rmap_insert(&self, pfn: Pfn, space: AddressSpaceId, address: VirtualAddress) {
        self.reserve_rmap(1);
        self.frames().rmap_insert(pfn, space, address);
    }

    /// Grow the rmap arena until `needed` nodes are spare. The new storage
    /// is allocated, and the old one dropped, with the frame lock released.
    pub(super) fn reserve_rmap(&self, needed: usize) {
        let wanted = needed + RMAP_HEADROOM;
        loop {
            let capacity = {
                let db = self.frames();
                if db.rmap_spare() >= wanted {
                    return;
                }
                db.rmap_capacity()
            };
            let storage = Vec::with_capacity((capacity * 2).max(capacity + wanted));
            // Bound to a local so it is dropped after the guard.
            let old = self.frames().rmap_adopt(storage);
            trace!("rmap arena grown past {capacity} nodes");
            drop(old);
        }
    }

    /// Forget one mapper; returns whether it was recorded.
    pub fn rmap_delete(&self, pfn: Pfn, space: AddressSpaceId, address: VirtualAddress) -> bool {
        self.frames().rmap_remove(pfn, space, address)
    }

    /// Current mappers of `pfn`.
    #[must_use]
    pub fn mappers(&self, pfn: Pfn) -> Vec<Mapper> {
        let mut mappers = Vec::new();
        loop {
            let count = self.frames().rmap_count(pfn);
            mappers.reserve(count);
            if self.frames().rmap_copy_into(pfn, &mut mappers) {
                return mappers;
            }
        }
    }

    /// Call `visitor` once per mapper of `pfn`, with no frame lock held.
    ///
    /// Mappers whose address space is gone are skipped. The visitor normally
    /// deletes the mapping; see [`unmap_all`](Self::unmap_all). Returns the
    /// number of visits.
    pub fn delete_all(&self, pfn: Pfn, mut visitor: impl FnMut(&AddressSpace, VirtualAddress)) -> usize {
        let mut visited = 0;
        for mapper in self.mappers(pfn) {
            if let Some(space) = self.space(mapper.space) {
                visitor(&space, mapper.address);
                visited += 1;
            }
        }
        visited
    }

    /// Remove every mapping of `pfn`; returns how many were removed.
    pub fn unmap_all(&self, pfn: Pfn) -> usize {
        let mut removed = 0;
        self.delete_all(pfn, |space, address| {
            let mut state = space.lock();
            if matches!(
                self.unmap_locked(space.id(), &mut state, address),
                Released::Frame { pfn: Some(_), .. }
            ) {
                removed += 1;
            }
        });
        debug!("{pfn}: {removed} mappings removed");
        removed
    }

    /// Whether the frame is modified or any mapping has written to it.
    #[must_use]
    pub fn is_dirty_any(&self, pfn: Pfn) -> bool {
        if self.frames().entry(pfn).flags().modified() {
            return true;
        }
        let mut dirty = false;
        self.visit_leaves(pfn, |leaf, _| {
            dirty |= leaf.dirty();
            false
        });
        dirty
    }

    /// Clean every mapping and the frame itself. Returns the number of
    /// entries (and the frame's own modified bit) that changed.
    pub fn set_clean_all(&self, pfn: Pfn) -> usize {
        let mut changed = self.visit_leaves(pfn, |leaf, _| {
            let was = leaf.dirty();
            leaf.set_dirty(false);
            was
        });
        let mut db = self.frames();
        if db.entry(pfn).flags().modified() {
            db.set_modified(pfn, false);
            changed += 1;
        }
        changed
    }

    /// Mark every mapping dirty.
    pub fn set_dirty_all(&self, pfn: Pfn) -> usize {
        self.visit_leaves(pfn, |leaf, _| {
            let was = leaf.dirty();
            leaf.set_dirty(true);
            !was
        })
    }

    /// Visit each present leaf mapping `pfn`; `f` returns whether it changed
    /// the entry, which flushes the page. Returns the number of changes.
    fn visit_leaves(&self, pfn: Pfn, mut f: impl FnMut(&mut PageTableEntry, VirtualAddress) -> bool) -> usize {
        let mut changed = 0;
        for mapper in self.mappers(pfn) {
            let Some(space) = self.space(mapper.space) else {
                continue;
            };
            let state = space.lock();
            let mut walker = self.walker(state.root);
            let Some(leaf) = walker.leaf(mapper.address) else {
                continue;
            };
            if !leaf.present() || leaf.frame_address() != pfn.physical_address() {
                continue;
            }
            if f(leaf, mapper.address) {
                invalidate_tlb_page(mapper.address);
                changed += 1;
            }
        }
        changed
    }
}
