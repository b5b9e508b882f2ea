use crate::info::SYSTEM_RANGE_START;
use crate::{ENTRIES_PER_TABLE, FrameAlloc, PageTable, PageTableEntry, PhysMapper, TableLevel};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use log::trace;

/// PML4 slot of the first kernel-half address.
#[allow(clippy::cast_possible_truncation)]
const FIRST_KERNEL_SLOT: usize = TableLevel::Pml4.index_of(VirtualAddress::new(SYSTEM_RANGE_START));

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum WalkError {
    /// No frame was available for a missing table at this level.
    #[error("out of memory allocating a {0} table")]
    OutOfMemory(TableLevel),
    /// A large-page leaf sits where a table was expected.
    #[error("large page mapped at {0} level")]
    LargePage(TableLevel),
    #[error("non-canonical address {0}")]
    NonCanonical(VirtualAddress),
}

/// Walks one 4-level hierarchy rooted at a PML4 frame.
///
/// All table frames are reached through the [`PhysMapper`]. Entry references
/// borrow the walker mutably, so at most one entry is live at a time.
pub struct PageTableWalker<'m, M: PhysMapper> {
    mapper: &'m M,
    root: PhysicalAddress,
}

impl<'m, M: PhysMapper> PageTableWalker<'m, M> {
    #[must_use]
    pub const fn new(mapper: &'m M, root: PhysicalAddress) -> Self {
        Self { mapper, root }
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn table(&self, pa: PhysicalAddress) -> &mut PageTable {
        // SAFETY: only frames linked into this hierarchy (or its root) reach
        // here, and they always hold page tables.
        unsafe { self.mapper.phys_to_mut::<PageTable>(pa) }
    }

    /// Physical address of the table at `level` covering `va`, if every
    /// table above it is present.
    fn table_at(&self, va: VirtualAddress, level: TableLevel) -> Option<PhysicalAddress> {
        let mut table = self.root;
        for current in TableLevel::ALL {
            if current == level {
                return Some(table);
            }
            let entry = *self.table(table).entry(current.index_of(va));
            if !entry.present() || entry.large_page() {
                return None;
            }
            table = entry.frame_address();
        }
        None
    }

    /// The entry for `va` at `level`, or `None` if a table above is missing.
    pub fn entry(&mut self, va: VirtualAddress, level: TableLevel) -> Option<&mut PageTableEntry> {
        let table = self.table_at(va, level)?;
        Some(self.table(table).entry_mut(level.index_of(va)))
    }

    /// The 4 KiB leaf entry for `va`, if its page table exists.
    #[inline]
    pub fn leaf(&mut self, va: VirtualAddress) -> Option<&mut PageTableEntry> {
        self.entry(va, TableLevel::Pt)
    }

    /// Physical frame of the page table holding the leaf for `va`.
    #[must_use]
    pub fn leaf_table(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.table_at(va, TableLevel::Pt)
    }

    /// The leaf entry for `va`, allocating and linking missing tables.
    ///
    /// New tables are zeroed; user-half links carry the user bit so the leaf
    /// alone decides user access.
    ///
    /// # Errors
    /// [`WalkError::OutOfMemory`] if `alloc` runs dry, [`WalkError::LargePage`]
    /// if the range is covered by a large leaf.
    #[inline]
    pub fn ensure_leaf<A: FrameAlloc>(
        &mut self,
        va: VirtualAddress,
        alloc: &mut A,
    ) -> Result<&mut PageTableEntry, WalkError> {
        self.ensure_entry(va, TableLevel::Pt, alloc)
    }

    /// The entry for `va` at `level`, allocating every table above it.
    ///
    /// # Errors
    /// As for [`ensure_leaf`](Self::ensure_leaf).
    pub fn ensure_entry<A: FrameAlloc>(
        &mut self,
        va: VirtualAddress,
        level: TableLevel,
        alloc: &mut A,
    ) -> Result<&mut PageTableEntry, WalkError> {
        if !va.is_canonical() {
            return Err(WalkError::NonCanonical(va));
        }
        let user = va.as_u64() < SYSTEM_RANGE_START;
        let mut table = self.root;
        let mut current = TableLevel::Pml4;
        while current != level {
            let Some(next) = current.next() else {
                break;
            };
            let index = current.index_of(va);
            let entry = *self.table(table).entry(index);
            if entry.present() {
                if entry.large_page() {
                    return Err(WalkError::LargePage(current));
                }
                table = entry.frame_address();
            } else {
                let frame = alloc.alloc_4k().ok_or(WalkError::OutOfMemory(next))?;
                self.table(frame).zero();
                *self.table(table).entry_mut(index) = PageTableEntry::new_table(frame, user);
                trace!("new {next} table at {frame} for {va}");
                table = frame;
            }
            current = next;
        }
        Ok(self.table(table).entry_mut(level.index_of(va)))
    }

    /// Translate `va` through present entries, honoring large leaves.
    #[must_use]
    pub fn translate(&mut self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let mut table = self.root;
        for level in TableLevel::ALL {
            let entry = *self.table(table).entry(level.index_of(va));
            if !entry.present() {
                return None;
            }
            if level == TableLevel::Pt || entry.large_page() {
                let mask = (1u64 << level.shift()) - 1;
                return Some(PhysicalAddress::new(
                    (entry.frame_address().as_u64() & !mask) | (va.as_u64() & mask),
                ));
            }
            table = entry.frame_address();
        }
        None
    }

    /// Copy the kernel-half PML4 slots from another root so both spaces see
    /// the same system mappings.
    pub fn copy_kernel_half(&mut self, from: PhysicalAddress) {
        for slot in FIRST_KERNEL_SLOT..ENTRIES_PER_TABLE {
            let entry = *self.table(from).entry(slot);
            *self.table(self.root).entry_mut(slot) = entry;
        }
    }

    /// Clear the user-half PML4 slots without releasing what they point to.
    ///
    /// Used on the boot root, whose user half only holds loader identity
    /// mappings.
    pub fn clear_user_half(&mut self) {
        let root = self.table(self.root);
        for slot in 0..FIRST_KERNEL_SLOT {
            *root.entry_mut(slot) = PageTableEntry::zero();
        }
    }

    /// Unlink and release every user-half table below the root.
    ///
    /// Leaf targets are not touched; callers must have torn the mappings
    /// down first. Returns the number of tables released.
    pub fn free_user_tables(&mut self, mut release: impl FnMut(PhysicalAddress)) -> usize {
        let mut freed = 0;
        for slot in 0..FIRST_KERNEL_SLOT {
            let entry = *self.table(self.root).entry(slot);
            if !entry.present() {
                continue;
            }
            freed += self.free_subtree(entry.frame_address(), TableLevel::Pdpt, &mut release);
            *self.table(self.root).entry_mut(slot) = PageTableEntry::zero();
        }
        freed
    }

    fn free_subtree(
        &self,
        table: PhysicalAddress,
        level: TableLevel,
        release: &mut impl FnMut(PhysicalAddress),
    ) -> usize {
        let mut freed = 0;
        if let Some(next) = level.next() {
            for index in 0..ENTRIES_PER_TABLE {
                let entry = *self.table(table).entry(index);
                if entry.present() && !entry.large_page() {
                    freed += self.free_subtree(entry.frame_address(), next, release);
                }
            }
        }
        release(table);
        freed + 1
    }
}
