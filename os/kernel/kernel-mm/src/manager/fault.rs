//! # Page fault resolution
//!
//! ```text
//!   leaf state   access            resolution
//!   ──────────   ───────────────   ───────────────────────────────────────
//!   empty        allowed           demand-zero frame
//!   swapped      allowed           transition frame (soft) or paging-file
//!                                  read (hard); the slot is released
//!   present      write, COW leaf   private copy, or flip in place when the
//!                                  frame has a single owner
//!   present      otherwise         spurious (another thread got there first)
//!   disabled     any               access violation
//! ```
//!
//! Every fault runs under the space lock of the faulting address, which
//! serializes it against other faults, unmaps and page-outs of that space.

use super::MemoryManager;
use super::mapping::{NewPage, is_user_address};
use crate::area::{AreaKind, RegionState};
use crate::balancer::MemoryConsumer;
use crate::error::MmError;
use crate::pfn::{PageUsage, Transition};
use crate::protection::{AccessKind, Protection};
use crate::space::{AddressSpace, AddressSpaceId, SpaceState};
use crate::swap::{Page, PageFileError, SwapEntry};
use core::hint::spin_loop;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_vmem::{PageFaultErrorCode, PageTableEntry, PhysMapper, PteState, invalidate_tlb_page};
use log::{debug, error, trace};

/// Privilege level the faulting access was made at.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProcessorMode {
    Kernel,
    User,
}

/// Who faulted.
#[derive(Copy, Clone)]
pub struct FaultContext<'a> {
    /// Address space of the faulting thread; kernel addresses always resolve
    /// against the system space.
    pub space: &'a AddressSpace,
    pub mode: ProcessorMode,
}

impl<'a> FaultContext<'a> {
    #[must_use]
    pub const fn new(space: &'a AddressSpace, mode: ProcessorMode) -> Self {
        Self { space, mode }
    }

    /// Access kind and mode encoded in a hardware `#PF` error code.
    #[must_use]
    pub const fn decode(code: PageFaultErrorCode) -> (AccessKind, ProcessorMode) {
        let access = if code.instruction_fetch() {
            AccessKind::Execute
        } else if code.write() {
            AccessKind::Write
        } else {
            AccessKind::Read
        };
        let mode = if code.user() {
            ProcessorMode::User
        } else {
            ProcessorMode::Kernel
        };
        (access, mode)
    }
}

/// How a fault was resolved.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultResolution {
    /// A zero-filled frame was mapped.
    DemandZero,
    /// The contents were still in memory on the modified or standby list.
    Transition,
    /// The contents were read back from a paging file.
    PageIn,
    /// A write-copy page got a private, writable copy.
    CopyOnWrite,
    /// The page was already valid for this access.
    Spurious,
}

/// Consumer new frames for `va` are charged to.
const fn consumer_for(va: VirtualAddress, kind: AreaKind) -> MemoryConsumer {
    match kind {
        AreaKind::Cache => MemoryConsumer::Cache,
        _ if is_user_address(va) => MemoryConsumer::User,
        _ => MemoryConsumer::System,
    }
}

impl<M: PhysMapper> MemoryManager<M> {
    /// Resolve a page fault at `address`.
    ///
    /// # Errors
    /// [`MmError::AccessViolation`] if the address is not backed by an area,
    /// the page is reserved, disabled or forbids the access, or a user-mode
    /// access touched the system range. [`MmError::InPageError`] if the
    /// paging file could not be read; the page is left swapped out.
    /// [`MmError::OutOfMemory`] if no frame could be found.
    pub fn handle_fault(
        &self,
        address: VirtualAddress,
        access: AccessKind,
        context: FaultContext<'_>,
    ) -> Result<FaultResolution, MmError> {
        if !address.is_canonical() {
            return Err(MmError::AccessViolation(address));
        }
        let user = is_user_address(address);
        if context.mode == ProcessorMode::User && !user {
            return Err(MmError::AccessViolation(address));
        }
        let space = if user { context.space } else { self.kernel.as_ref() };
        let mut state = space.lock();
        if state.deleted {
            return Err(MmError::AccessViolation(address));
        }
        let resolution = self.fault_locked(space.id(), &mut state, address.page_base(), access)?;
        trace!("{}: fault at {address} ({access:?}) -> {resolution:?}", space.id());
        Ok(resolution)
    }

    pub(super) fn fault_locked(
        &self,
        id: AddressSpaceId,
        state: &mut SpaceState,
        va: VirtualAddress,
        access: AccessKind,
    ) -> Result<FaultResolution, MmError> {
        let violation = MmError::AccessViolation(va);
        let (kind, region, protection) = state
            .areas
            .find_by_address(va)
            .and_then(|area| {
                let (region, protection) = area.page_attributes(va.page_number())?;
                Some((area.kind(), region, protection))
            })
            .ok_or(violation)?;
        if region == RegionState::Reserved || !protection.allows(access) {
            return Err(violation);
        }
        let consumer = consumer_for(va, kind);
        let effective = if access == AccessKind::Write && protection.is_copy_on_write() {
            protection.after_copy()
        } else {
            protection
        };

        let leaf = self
            .walker(state.root)
            .leaf(va)
            .copied()
            .unwrap_or_else(PageTableEntry::zero);
        match leaf.state() {
            PteState::Disabled => Err(violation),
            PteState::Present => match access {
                AccessKind::Write if !leaf.writable() => {
                    if leaf.copy_on_write() {
                        self.copy_on_write_locked(id, state, va, leaf, consumer)
                    } else {
                        Err(violation)
                    }
                }
                AccessKind::Execute if leaf.no_execute() => Err(violation),
                _ => Ok(FaultResolution::Spurious),
            },
            PteState::Swapped(locator) => {
                let swap = SwapEntry::from_locator(locator);
                self.page_in_locked(id, state, va, swap, effective, access, consumer)
            }
            PteState::Empty => {
                let page = NewPage {
                    protection: effective,
                    consumer,
                    usage: PageUsage::Mapped,
                    dirty: access == AccessKind::Write,
                };
                self.map_new_frame_locked(id, state, va, page)?;
                Ok(FaultResolution::DemandZero)
            }
        }
    }

    fn copy_on_write_locked(
        &self,
        id: AddressSpaceId,
        state: &mut SpaceState,
        va: VirtualAddress,
        leaf: PageTableEntry,
        consumer: MemoryConsumer,
    ) -> Result<FaultResolution, MmError> {
        let protection = Protection::from_entry(&leaf).after_copy();
        let Some(pfn) = self.frames().pfn(leaf.frame_address().frame_number()) else {
            return Err(MmError::AccessViolation(va));
        };
        let exclusive = {
            let db = self.frames();
            let entry = db.entry(pfn);
            entry.share_count() == 1 && entry.reference_count() == 1
        };
        if exclusive {
            if let Some(entry) = self.walker(state.root).leaf(va) {
                *entry = protection
                    .to_entry(pfn.physical_address(), is_user_address(va))
                    .with_dirty(true)
                    .with_accessed(true);
            }
            invalidate_tlb_page(va);
            debug!("{id}: {va} made writable in place");
            return Ok(FaultResolution::CopyOnWrite);
        }

        let copy = self.allocate_frame(consumer, PageUsage::Mapped, false)?;
        self.copy_frame(pfn, copy);
        if let Err(error) = self.install_locked(id, state, va, copy, protection, true, true) {
            self.free(copy);
            return Err(error);
        }
        self.frames().dereference(copy);
        debug!("{id}: {va} copied from {pfn} to {copy}");
        Ok(FaultResolution::CopyOnWrite)
    }

    #[allow(clippy::too_many_arguments)]
    fn page_in_locked(
        &self,
        id: AddressSpaceId,
        state: &mut SpaceState,
        va: VirtualAddress,
        swap: SwapEntry,
        protection: Protection,
        access: AccessKind,
        consumer: MemoryConsumer,
    ) -> Result<FaultResolution, MmError> {
        let dirty = access == AccessKind::Write;
        loop {
            let claimed = self.frames().claim_transition(swap, consumer);
            match claimed {
                Transition::Busy(_) => spin_loop(),
                Transition::Claimed(pfn) => {
                    // The slot goes away with the swap entry; memory holds
                    // the only copy from here on.
                    self.frames().set_modified(pfn, true);
                    if let Err(error) = self.install_locked(id, state, va, pfn, protection, true, dirty) {
                        self.free(pfn);
                        return Err(error);
                    }
                    self.frames().dereference(pfn);
                    debug!("{id}: {va} reclaimed {pfn} for slot {:#x}", swap.locator());
                    return Ok(FaultResolution::Transition);
                }
                Transition::Absent => break,
            }
        }

        let pfn = self.allocate_frame(consumer, PageUsage::Mapped, false)?;
        self.frames().update_flags(pfn, |f| f.set_read_in_progress(true));
        let io = self.swap.lock().io(swap);
        let result = match io {
            Some(io) => self.with_io_retries(|| {
                // SAFETY: the frame was just allocated and is not mapped yet.
                io.read_page(swap, unsafe { self.frame_contents(pfn) })
            }),
            None => Err(PageFileError::InvalidLocator(swap.locator())),
        };
        self.frames().update_flags(pfn, |f| f.set_read_in_progress(false));
        if let Err(error) = result {
            error!("{id}: in-page error at {va}: {error}");
            self.free(pfn);
            return Err(MmError::InPageError(va));
        }
        self.frames().set_modified(pfn, true);
        if let Err(error) = self.install_locked(id, state, va, pfn, protection, true, dirty) {
            self.free(pfn);
            return Err(error);
        }
        self.frames().dereference(pfn);
        debug!("{id}: {va} paged in from slot {:#x}", swap.locator());
        Ok(FaultResolution::PageIn)
    }

    /// Read `buffer.len()` bytes at `address` in another address space,
    /// faulting pages in as needed.
    ///
    /// # Errors
    /// Whatever a read fault at the touched pages would report.
    pub fn copy_from_space(
        &self,
        space: &AddressSpace,
        address: VirtualAddress,
        buffer: &mut [u8],
    ) -> Result<(), MmError> {
        let mut state = space.lock();
        let mut done = 0;
        while done < buffer.len() {
            let (frame, offset, chunk) = self.chunk_locked(space, &mut state, address, done, buffer.len(), AccessKind::Read)?;
            // SAFETY: the frame stays mapped while the space lock is held.
            let page = unsafe { self.mapper.phys_to_mut::<Page>(frame) };
            buffer[done..done + chunk].copy_from_slice(&page[offset..offset + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Write `data` at `address` in another address space, faulting pages
    /// in (and resolving copy-on-write) as needed.
    ///
    /// # Errors
    /// Whatever a write fault at the touched pages would report.
    pub fn copy_to_space(&self, space: &AddressSpace, address: VirtualAddress, data: &[u8]) -> Result<(), MmError> {
        let mut state = space.lock();
        let mut done = 0;
        while done < data.len() {
            let (frame, offset, chunk) = self.chunk_locked(space, &mut state, address, done, data.len(), AccessKind::Write)?;
            // SAFETY: as in `copy_from_space`.
            let page = unsafe { self.mapper.phys_to_mut::<Page>(frame) };
            page[offset..offset + chunk].copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Resident frame, offset and length of the next piece of a copy.
    #[allow(clippy::cast_possible_truncation)]
    fn chunk_locked(
        &self,
        space: &AddressSpace,
        state: &mut SpaceState,
        address: VirtualAddress,
        done: usize,
        total: usize,
        access: AccessKind,
    ) -> Result<(PhysicalAddress, usize, usize), MmError> {
        let va = address
            .checked_add(done as u64)
            .filter(|va| space.kind().contains(*va))
            .ok_or(MmError::InvalidAddress(address))?;
        let page = va.page_base();
        let offset = va.page_offset() as usize;
        let chunk = (PAGE_SIZE as usize - offset).min(total - done);

        let ready = self
            .walker(state.root)
            .leaf(page)
            .is_some_and(|e| e.present() && (access != AccessKind::Write || e.writable()));
        if !ready {
            self.fault_locked(space.id(), state, page, access)?;
        }
        let mut walker = self.walker(state.root);
        let leaf = walker
            .leaf(page)
            .filter(|e| e.present())
            .ok_or(MmError::AccessViolation(va))?;
        if access == AccessKind::Write {
            leaf.set_dirty(true);
            leaf.set_accessed(true);
        }
        Ok((leaf.frame_address(), offset, chunk))
    }
}
