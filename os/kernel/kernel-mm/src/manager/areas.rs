use super::MemoryManager;
use super::mapping::Released;
use crate::area::{AreaFlags, AreaKind, FreedPage, MemoryArea, PageDisposition, RegionState};
use crate::error::MmError;
use crate::pfn::Pfn;
use crate::protection::Protection;
use crate::space::{AddressSpace, AddressSpaceId, SpaceKind, SpaceState};
use crate::swap::SwapEntry;
use alloc::vec::Vec;
use kernel_info::memory::VIRTUAL_MEMORY_GRANULARITY;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, VirtualPageNumber, bytes_to_pages};
use kernel_vmem::{PageTableEntry, PhysMapper, PteState};
use log::{debug, warn};

/// Area placement granularity in pages.
const GRANULARITY_PAGES: u64 = VIRTUAL_MEMORY_GRANULARITY / PAGE_SIZE;

/// Outcome of [`MemoryManager::free_area`].
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct FreedArea {
    /// Frames that were unmapped.
    pub released: usize,
    /// Swap slots now owned by the caller, by page address.
    pub swapped: Vec<(VirtualAddress, SwapEntry)>,
}

impl<M: PhysMapper> MemoryManager<M> {
    /// Reserve `length` bytes (rounded up to pages) in `space`.
    ///
    /// Without a hint the area goes into the lowest (or, with
    /// [`AreaFlags::top_down`], highest) free gap on a 64 KiB boundary.
    /// Kernel areas without a hint are placed in the system PTE region.
    ///
    /// # Errors
    /// [`MmError::InvalidLength`] for an empty request,
    /// [`MmError::InvalidAddress`] for an unaligned or out-of-space hint,
    /// [`MmError::AreaConflict`] if the hinted range is taken and
    /// [`MmError::NoVirtualSpace`] if no gap fits.
    pub fn create_area(
        &self,
        space: &AddressSpace,
        kind: AreaKind,
        hint: Option<VirtualAddress>,
        length: u64,
        protection: Protection,
        flags: AreaFlags,
    ) -> Result<VirtualAddress, MmError> {
        if length == 0 {
            return Err(MmError::InvalidLength(length));
        }
        let pages = bytes_to_pages(length);
        let mut state = space.lock();
        if state.deleted {
            return Err(MmError::UnknownAddressSpace);
        }
        let start = match hint {
            Some(va) => {
                if !va.is_page_aligned() || !space.kind().contains(va) {
                    return Err(MmError::InvalidAddress(va));
                }
                let start = va.page_number();
                let end = start.checked_add(pages).ok_or(MmError::InvalidLength(length))?;
                if state.areas.find_by_range(start, end).is_some() {
                    return Err(MmError::AreaConflict(va));
                }
                start
            }
            None => self
                .find_gap_locked(space.kind(), &state, pages, GRANULARITY_PAGES, flags.top_down())
                .ok_or(MmError::NoVirtualSpace(length))?,
        };
        let area = MemoryArea::new(start, pages, kind, protection, flags);
        let address = area.start();
        state
            .areas
            .insert(area)
            .map_err(|_| MmError::InvalidAddress(address))?;
        debug!("{}: area {kind:?} at {address}, {pages} pages", space.id());
        Ok(address)
    }

    /// Base of a free range of `length` bytes on a `granularity` boundary.
    #[must_use]
    pub fn find_gap(
        &self,
        space: &AddressSpace,
        length: u64,
        granularity: u64,
        top_down: bool,
    ) -> Option<VirtualAddress> {
        let state = space.lock();
        let granularity = (granularity / PAGE_SIZE).max(1);
        self.find_gap_locked(space.kind(), &state, bytes_to_pages(length), granularity, top_down)
            .map(VirtualPageNumber::base)
    }

    fn find_gap_locked(
        &self,
        kind: SpaceKind,
        state: &SpaceState,
        pages: u64,
        granularity: u64,
        top_down: bool,
    ) -> Option<VirtualPageNumber> {
        match kind {
            SpaceKind::Process => state.areas.find_gap(pages, granularity, top_down),
            SpaceKind::Kernel => {
                let region = self.layout.system_ptes;
                state.areas.find_gap_in(
                    pages,
                    granularity,
                    top_down,
                    region.start.page_number(),
                    region.end.page_number(),
                )
            }
        }
    }

    /// Copy of the area containing `address`.
    #[must_use]
    pub fn find_area_by_address(&self, space: &AddressSpace, address: VirtualAddress) -> Option<MemoryArea> {
        space.lock().areas.find_by_address(address).cloned()
    }

    /// Copy of the first area overlapping `[address, address + length)`.
    #[must_use]
    pub fn find_area_by_range(
        &self,
        space: &AddressSpace,
        address: VirtualAddress,
        length: u64,
    ) -> Option<MemoryArea> {
        let start = address.page_number();
        let end = start.checked_add(bytes_to_pages(length.max(1)))?;
        space.lock().areas.find_by_range(start, end).cloned()
    }

    /// Release the area starting at `start`.
    ///
    /// `disposition` is asked once per mapped or swapped page what becomes of
    /// its contents.
    ///
    /// # Errors
    /// [`MmError::InvalidAddress`] if no area starts at `start` or it is one
    /// of the static system areas.
    pub fn free_area(
        &self,
        space: &AddressSpace,
        start: VirtualAddress,
        mut disposition: impl FnMut(&FreedPage) -> PageDisposition,
    ) -> Result<FreedArea, MmError> {
        let mut state = space.lock();
        self.free_area_locked(space.id(), &mut state, start, &mut disposition)
    }

    pub(super) fn free_area_locked(
        &self,
        id: AddressSpaceId,
        state: &mut SpaceState,
        start: VirtualAddress,
        disposition: &mut dyn FnMut(&FreedPage) -> PageDisposition,
    ) -> Result<FreedArea, MmError> {
        let removable = state
            .areas
            .find_by_address(start)
            .is_some_and(|a| a.start() == start && !a.flags().is_static());
        if !removable {
            return Err(MmError::InvalidAddress(start));
        }
        let Some(area) = state.areas.remove(start.page_number()) else {
            return Err(MmError::InvalidAddress(start));
        };

        let mut freed = FreedArea::default();
        for va in area.page_addresses() {
            let Some(old) = self.walker(state.root).leaf(va).copied() else {
                continue;
            };
            match old.state() {
                PteState::Empty => {}
                PteState::Present | PteState::Disabled => {
                    let frame = self.frames().pfn(old.frame_address().frame_number());
                    let page = FreedPage {
                        address: va,
                        frame,
                        swap: None,
                        dirty: old.dirty(),
                    };
                    if let Some(pfn) = frame {
                        self.prepare_release(state, &page, pfn, disposition(&page), &mut freed);
                    }
                    if matches!(self.unmap_locked(id, state, va), Released::Frame { pfn: Some(_), .. }) {
                        freed.released += 1;
                    }
                }
                PteState::Swapped(locator) => {
                    let swap = SwapEntry::from_locator(locator);
                    let page = FreedPage {
                        address: va,
                        frame: None,
                        swap: Some(swap),
                        dirty: false,
                    };
                    if disposition(&page) == PageDisposition::Discard {
                        self.unmap_locked(id, state, va);
                    } else {
                        if let Some(leaf) = self.walker(state.root).leaf(va) {
                            *leaf = PageTableEntry::zero();
                        }
                        freed.swapped.push((va, swap));
                    }
                }
            }
        }
        debug!(
            "{id}: area at {start} freed, {} frames released, {} slots handed back",
            freed.released,
            freed.swapped.len()
        );
        Ok(freed)
    }

    /// Set up the frame so that unmapping it honours `choice`.
    fn prepare_release(
        &self,
        state: &SpaceState,
        page: &FreedPage,
        pfn: Pfn,
        choice: PageDisposition,
        freed: &mut FreedArea,
    ) {
        let choice = match choice {
            PageDisposition::Swap => match self.swap.lock().allocate() {
                Some(slot) => {
                    let mut db = self.frames();
                    db.set_saved_swap_entry(pfn, Some(slot));
                    db.set_modified(pfn, true);
                    freed.swapped.push((page.address, slot));
                    return;
                }
                None => {
                    warn!("no swap slot for {}, writing back instead", page.address);
                    PageDisposition::WriteBack
                }
            },
            other => other,
        };
        let mut db = self.frames();
        match choice {
            PageDisposition::WriteBack if db.saved_swap_entry(pfn).is_some() => {
                db.set_modified(pfn, true);
            }
            PageDisposition::WriteBack | PageDisposition::Discard => {
                if choice == PageDisposition::WriteBack {
                    warn!("{pfn} at {} has no backing store, discarding", page.address);
                }
                db.set_modified(pfn, false);
                db.set_saved_swap_entry(pfn, None);
                drop(db);
                if let Some(leaf) = self.walker(state.root).leaf(page.address) {
                    leaf.set_dirty(false);
                }
            }
            PageDisposition::Swap => {}
        }
    }

    /// Change the state and protection of `[address, address + length)`
    /// inside one area.
    ///
    /// Decommitting unmaps the pages; otherwise present and disabled pages
    /// take the new protection.
    ///
    /// # Errors
    /// [`MmError::InvalidAddress`] if the range is not inside a single area,
    /// [`MmError::InvalidLength`] for an empty range.
    pub fn alter_region(
        &self,
        space: &AddressSpace,
        address: VirtualAddress,
        length: u64,
        new_state: RegionState,
        protection: Protection,
    ) -> Result<(), MmError> {
        if length == 0 {
            return Err(MmError::InvalidLength(length));
        }
        let start = address.page_number();
        let end = start
            .checked_add(bytes_to_pages(address.page_offset() + length))
            .ok_or(MmError::InvalidLength(length))?;
        let mut state = space.lock();
        let altered = {
            let area = state
                .areas
                .find_by_address_mut(address)
                .filter(|a| end <= a.end_vpn())
                .ok_or(MmError::InvalidAddress(address))?;
            area.regions_mut().alter(start, end, new_state, protection)
        };
        for range in altered {
            for page in 0..(range.end - range.start) {
                let va = (range.start + page).base();
                if new_state == RegionState::Reserved {
                    self.unmap_locked(space.id(), &mut state, va);
                } else {
                    self.reprotect_locked(&state, va, protection);
                }
            }
        }
        Ok(())
    }
}
