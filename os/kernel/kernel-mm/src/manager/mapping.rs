use super::MemoryManager;
use crate::balancer::MemoryConsumer;
use crate::error::MmError;
use crate::pfn::{PageUsage, Pfn, Transition};
use crate::protection::Protection;
use crate::space::{AddressSpace, AddressSpaceId, SpaceState};
use crate::swap::SwapEntry;
use core::hint::spin_loop;
use kernel_info::memory::SYSTEM_RANGE_START;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_vmem::{PageTableEntry, PhysMapper, PteState, invalidate_tlb_page};
use log::{debug, trace, warn};

/// Leaves below the system range carry the user bit.
pub(super) const fn is_user_address(va: VirtualAddress) -> bool {
    va.as_u64() < SYSTEM_RANGE_START
}

/// A zeroed frame to be allocated and mapped in one go.
#[derive(Debug, Copy, Clone)]
pub(super) struct NewPage {
    pub protection: Protection,
    pub consumer: MemoryConsumer,
    pub usage: PageUsage,
    pub dirty: bool,
}

/// What tearing down one leaf released.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(super) enum Released {
    Nothing,
    Frame { pfn: Option<Pfn>, dirty: bool },
    Swap(SwapEntry),
}

fn page_address(base: VirtualAddress, page: usize) -> Result<VirtualAddress, MmError> {
    base.checked_add(page as u64 * PAGE_SIZE)
        .filter(|va| va.is_canonical())
        .ok_or(MmError::InvalidAddress(base))
}

impl<M: PhysMapper> MemoryManager<M> {
    /// Map `frames` at consecutive pages starting at `address`.
    ///
    /// Each frame gains a reference, a share and a reverse mapping. Missing
    /// page tables are allocated on the way.
    ///
    /// # Errors
    /// [`MmError::MappingConflict`] if any page already holds a mapping or
    /// swap entry, [`MmError::InvalidAddress`] if the range is unaligned or
    /// leaves the canonical address space. Nothing stays mapped on error.
    pub fn create_mapping(
        &self,
        space: &AddressSpace,
        address: VirtualAddress,
        protection: Protection,
        frames: &[Pfn],
    ) -> Result<(), MmError> {
        let mut state = space.lock();
        self.map_frames_locked(space.id(), &mut state, address, protection, frames, false)
    }

    /// Like [`create_mapping`](Self::create_mapping), but replaces whatever
    /// the pages held before. Replaced frames lose their mapping reference,
    /// replaced swap entries give their slot back.
    ///
    /// # Errors
    /// [`MmError::OutOfMemory`] if a page table could not be allocated.
    pub fn create_mapping_unsafe(
        &self,
        space: &AddressSpace,
        address: VirtualAddress,
        protection: Protection,
        frames: &[Pfn],
    ) -> Result<(), MmError> {
        let mut state = space.lock();
        self.map_frames_locked(space.id(), &mut state, address, protection, frames, true)
    }

    pub(super) fn map_frames_locked(
        &self,
        id: AddressSpaceId,
        state: &mut SpaceState,
        address: VirtualAddress,
        protection: Protection,
        frames: &[Pfn],
        overwrite: bool,
    ) -> Result<(), MmError> {
        if !address.is_page_aligned() {
            return Err(MmError::InvalidAddress(address));
        }
        // The whole range must be addressable before the first page goes in.
        if let Some(last) = frames.len().checked_sub(1) {
            page_address(address, last)?;
        }
        for (page, &pfn) in frames.iter().enumerate() {
            let va = address.add_pages(page as u64);
            if let Err(error) = self.install_locked(id, state, va, pfn, protection, overwrite, false) {
                for undo in 0..page {
                    self.unmap_locked(id, state, address.add_pages(undo as u64));
                }
                return Err(error);
            }
        }
        debug!("{id}: mapped {} pages at {address}", frames.len());
        Ok(())
    }

    /// Write one leaf for `pfn` and account for it.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn install_locked(
        &self,
        id: AddressSpaceId,
        state: &mut SpaceState,
        va: VirtualAddress,
        pfn: Pfn,
        protection: Protection,
        overwrite: bool,
        dirty: bool,
    ) -> Result<(), MmError> {
        let mut walker = self.walker(state.root);
        let old = *walker.ensure_leaf(va, &mut self.table_frames())?;
        if !old.is_empty() {
            if !overwrite {
                return Err(MmError::MappingConflict(va));
            }
            self.release_entry(id, va, old);
        }
        let pte_frame = self.pte_frame(&walker, va);
        let entry = protection
            .to_entry(pfn.physical_address(), is_user_address(va))
            .with_dirty(dirty)
            .with_accessed(dirty);
        if let Some(leaf) = walker.leaf(va) {
            *leaf = entry;
        }
        if !old.is_empty() {
            invalidate_tlb_page(va);
        }
        self.reserve_rmap(1);
        let mut db = self.frames();
        db.add_mapping(pfn, id, va, pte_frame);
        db.update_flags(pfn, |flags| flags.set_cache_attribute(protection.cache_attribute()));
        trace!("{id}: {va} -> {pfn} {protection:?}");
        Ok(())
    }

    /// Remove the mapping at `address`.
    ///
    /// Returns whether the page was dirty and the frame it mapped. Swap
    /// entries give their slot back and report no frame; a frame still being
    /// written out from that slot is waited for first.
    ///
    /// # Errors
    /// [`MmError::InvalidAddress`] if `address` is not canonical.
    pub fn delete_mapping(
        &self,
        space: &AddressSpace,
        address: VirtualAddress,
    ) -> Result<(bool, Option<Pfn>), MmError> {
        if !address.is_canonical() {
            return Err(MmError::InvalidAddress(address));
        }
        let mut state = space.lock();
        Ok(match self.unmap_locked(space.id(), &mut state, address.page_base()) {
            Released::Frame { pfn, dirty } => (dirty, pfn),
            Released::Nothing | Released::Swap(_) => (false, None),
        })
    }

    /// Clear the leaf at `va` and release what it held.
    pub(super) fn unmap_locked(&self, id: AddressSpaceId, state: &mut SpaceState, va: VirtualAddress) -> Released {
        let mut walker = self.walker(state.root);
        let Some(leaf) = walker.leaf(va) else {
            return Released::Nothing;
        };
        let old = core::mem::replace(leaf, PageTableEntry::zero());
        if old.present() {
            invalidate_tlb_page(va);
        }
        self.release_entry(id, va, old)
    }

    /// Drop the bookkeeping of an entry that has already been replaced.
    fn release_entry(&self, id: AddressSpaceId, va: VirtualAddress, old: PageTableEntry) -> Released {
        match old.state() {
            PteState::Empty => Released::Nothing,
            PteState::Present | PteState::Disabled => {
                let dirty = old.dirty();
                let mut db = self.frames();
                let pfn = db.pfn(old.frame_address().frame_number());
                if let Some(pfn) = pfn {
                    if dirty {
                        db.set_modified(pfn, true);
                    }
                    db.remove_mapping(pfn, id, va);
                }
                Released::Frame { pfn, dirty }
            }
            PteState::Swapped(locator) => {
                let swap = SwapEntry::from_locator(locator);
                self.release_swap_slot(swap);
                Released::Swap(swap)
            }
        }
    }

    /// Give a slot back, dropping any frame that still caches its contents.
    pub(super) fn release_swap_slot(&self, swap: SwapEntry) {
        while matches!(self.frames().discard_transition(swap), Transition::Busy(_)) {
            spin_loop();
        }
        if let Err(error) = self.swap.lock().free(swap) {
            warn!("releasing swap slot: {error}");
        }
    }

    /// Access rights of the page at `address`; `None` if nothing is mapped.
    #[must_use]
    pub fn get_protection(&self, space: &AddressSpace, address: VirtualAddress) -> Option<Protection> {
        let state = space.lock();
        let mut walker = self.walker(state.root);
        let leaf = *walker.leaf(address)?;
        matches!(leaf.state(), PteState::Present | PteState::Disabled).then(|| Protection::from_entry(&leaf))
    }

    /// Change the access rights of a mapped page.
    ///
    /// `NoAccess` disables the mapping but keeps its frame; any other
    /// protection re-enables it.
    ///
    /// # Errors
    /// [`MmError::InvalidAddress`] if no frame is mapped at `address`.
    pub fn set_protection(
        &self,
        space: &AddressSpace,
        address: VirtualAddress,
        protection: Protection,
    ) -> Result<(), MmError> {
        let state = space.lock();
        self.reprotect_locked(&state, address.page_base(), protection)
            .then_some(())
            .ok_or(MmError::InvalidAddress(address))
    }

    pub(super) fn reprotect_locked(&self, state: &SpaceState, va: VirtualAddress, protection: Protection) -> bool {
        let mut walker = self.walker(state.root);
        let Some(leaf) = walker.leaf(va) else {
            return false;
        };
        if !matches!(leaf.state(), PteState::Present | PteState::Disabled) {
            return false;
        }
        let old = *leaf;
        *leaf = protection
            .to_entry(old.frame_address(), is_user_address(va))
            .with_dirty(old.dirty())
            .with_accessed(old.accessed());
        if old.present() {
            invalidate_tlb_page(va);
        }
        true
    }

    #[must_use]
    pub fn query_present(&self, space: &AddressSpace, address: VirtualAddress) -> bool {
        self.leaf_of(space, address).is_some_and(|e| e.present())
    }

    #[must_use]
    pub fn query_dirty(&self, space: &AddressSpace, address: VirtualAddress) -> bool {
        self.leaf_of(space, address).is_some_and(|e| e.present() && e.dirty())
    }

    /// Whether the page holds a no-access mapping that still owns a frame.
    #[must_use]
    pub fn is_disabled_page(&self, space: &AddressSpace, address: VirtualAddress) -> bool {
        self.leaf_of(space, address)
            .is_some_and(|e| e.state() == PteState::Disabled)
    }

    #[must_use]
    pub fn is_swap_entry(&self, space: &AddressSpace, address: VirtualAddress) -> bool {
        self.get_page_file_mapping(space, address).is_some()
    }

    pub fn set_dirty(&self, space: &AddressSpace, address: VirtualAddress) {
        self.update_leaf(space, address, |e| e.set_dirty(true));
    }

    /// Clear the dirty bit. The contents are not written anywhere.
    pub fn set_clean(&self, space: &AddressSpace, address: VirtualAddress) {
        self.update_leaf(space, address, |e| e.set_dirty(false));
    }

    /// Swap entry stored at `address`.
    #[must_use]
    pub fn get_page_file_mapping(&self, space: &AddressSpace, address: VirtualAddress) -> Option<SwapEntry> {
        self.leaf_of(space, address)?
            .swap_locator()
            .map(SwapEntry::from_locator)
    }

    /// Record that the contents of `address` live at `swap`. The slot now
    /// belongs to the page table entry.
    ///
    /// # Errors
    /// [`MmError::MappingConflict`] if the page is mapped or already swapped.
    pub fn create_page_file_mapping(
        &self,
        space: &AddressSpace,
        address: VirtualAddress,
        swap: SwapEntry,
    ) -> Result<(), MmError> {
        let state = space.lock();
        let mut walker = self.walker(state.root);
        let leaf = walker.ensure_leaf(address, &mut self.table_frames())?;
        if !leaf.is_empty() {
            return Err(MmError::MappingConflict(address));
        }
        *leaf = PageTableEntry::new_swap(swap.locator());
        Ok(())
    }

    /// Clear a swap entry and hand its slot to the caller.
    pub fn delete_page_file_mapping(&self, space: &AddressSpace, address: VirtualAddress) -> Option<SwapEntry> {
        let state = space.lock();
        let mut walker = self.walker(state.root);
        let leaf = walker.leaf(address)?;
        let swap = leaf.swap_locator().map(SwapEntry::from_locator)?;
        *leaf = PageTableEntry::zero();
        Some(swap)
    }

    fn leaf_of(&self, space: &AddressSpace, address: VirtualAddress) -> Option<PageTableEntry> {
        if !address.is_canonical() {
            return None;
        }
        let state = space.lock();
        let mut walker = self.walker(state.root);
        walker.leaf(address).copied()
    }

    fn update_leaf(&self, space: &AddressSpace, address: VirtualAddress, f: impl FnOnce(&mut PageTableEntry)) {
        let state = space.lock();
        let mut walker = self.walker(state.root);
        if let Some(leaf) = walker.leaf(address).filter(|e| e.present()) {
            f(leaf);
            invalidate_tlb_page(address);
        }
    }

    /// Allocate a zeroed frame and map it; the mapping holds the only
    /// reference afterwards.
    pub(super) fn map_new_frame_locked(
        &self,
        id: AddressSpaceId,
        state: &mut SpaceState,
        va: VirtualAddress,
        page: NewPage,
    ) -> Result<Pfn, MmError> {
        let pfn = self.allocate_frame(page.consumer, page.usage, true)?;
        if let Err(error) = self.install_locked(id, state, va, pfn, page.protection, false, page.dirty) {
            self.free(pfn);
            return Err(error);
        }
        self.frames().dereference(pfn);
        Ok(pfn)
    }
}
