//! # Paging files, page-out and the background workers
//!
//! A user page leaves memory in two steps. [`MemoryManager::page_out`]
//! replaces its only mapping with a swap entry for a fresh slot and drops
//! the frame onto the modified list, still indexed by that slot. The
//! modified page writer ([`MemoryManager::write_modified_pages`]) later
//! stores the contents and frees the frame. A fault in between finds the
//! frame through the slot and takes it back without any I/O.

use super::MemoryManager;
use crate::balancer::MemoryConsumer;
use crate::error::MmError;
use crate::pfn::{PageLocation, PageUsage, Pfn, PfnDatabase, SlotTable};
use crate::rmap::Mapper;
use crate::swap::{PageFileError, PageFileIo, SwapEntry};
use alloc::sync::Arc;
use alloc::vec;
use kernel_vmem::{PageTableEntry, PhysMapper, invalidate_tlb_page};
use log::{debug, error, trace, warn};

impl<M: PhysMapper> MemoryManager<M> {
    /// Add a paging file of `slots` pages backed by `io`.
    ///
    /// # Errors
    /// [`MmError::PageFile`] past the file limit or for an empty file.
    pub fn register_paging_file(&self, slots: u64, io: Arc<dyn PageFileIo>) -> Result<u8, MmError> {
        let (index, slots) = {
            let mut swap = self.swap.lock();
            let index = swap.register(slots, io)?;
            (index, swap.slots(index).unwrap_or(0))
        };
        // Sized here so that indexing a slot later never allocates.
        #[allow(clippy::cast_possible_truncation)]
        let table: SlotTable = vec![None; slots as usize];
        let old = self.frames().attach_paging_file(index, table);
        drop(old);
        self.swap.lock().bring_online(index);
        Ok(index)
    }

    /// Claim a paging file slot for a caller that manages its own backing.
    #[must_use]
    pub fn allocate_swap_slot(&self) -> Option<SwapEntry> {
        self.swap.lock().allocate()
    }

    /// # Errors
    /// [`MmError::PageFile`] if the slot is not allocated.
    pub fn free_swap_slot(&self, entry: SwapEntry) -> Result<(), MmError> {
        Ok(self.swap.lock().free(entry)?)
    }

    /// Slots in use and slots in total across all paging files.
    #[must_use]
    pub fn swap_usage(&self) -> (u64, u64) {
        let files = self.swap.lock();
        (files.used_slots(), files.total_slots())
    }

    /// Run `op` up to [`io_retries`](crate::MmConfig::io_retries) times.
    pub(super) fn with_io_retries(
        &self,
        mut op: impl FnMut() -> Result<(), PageFileError>,
    ) -> Result<(), PageFileError> {
        let attempts = self.config.io_retries.max(1);
        let mut last = PageFileError::Io(0);
        for attempt in 1..=attempts {
            match op() {
                Ok(()) => return Ok(()),
                Err(error) => {
                    warn!("paging file I/O failed (attempt {attempt}/{attempts}): {error}");
                    last = error;
                }
            }
        }
        Err(last)
    }

    /// Move a user page out of its address space.
    ///
    /// Only frames with a single mapping and no other references qualify,
    /// and only if the owning space is not locked right now. Returns whether
    /// the page went out.
    ///
    /// # Errors
    /// [`MmError::PagingFileFull`] if no slot is left.
    pub fn page_out(&self, pfn: Pfn) -> Result<bool, MmError> {
        let Some(Mapper { space: space_id, address }) = Self::sole_user_mapper(&self.frames(), pfn) else {
            return Ok(false);
        };
        let Some(space) = self.space(space_id) else {
            return Ok(false);
        };
        let Some(state) = space.try_lock() else {
            trace!("{space_id} busy, skipping {pfn}");
            return Ok(false);
        };
        if state.areas.find_by_address(address).is_none_or(|a| a.flags().locked()) {
            return Ok(false);
        }
        let mut walker = self.walker(state.root);
        let Some(leaf) = walker.leaf(address) else {
            return Ok(false);
        };
        if !leaf.present() || leaf.frame_address() != pfn.physical_address() {
            return Ok(false);
        }
        let slot = self.swap.lock().allocate().ok_or(MmError::PagingFileFull)?;

        // The frame lock was dropped above; another space may have mapped
        // or referenced the frame since.
        let mut db = self.frames();
        if Self::sole_user_mapper(&db, pfn) != Some(Mapper { space: space_id, address }) {
            drop(db);
            trace!("{pfn} gained a reference, keeping it resident");
            if let Err(error) = self.swap.lock().free(slot) {
                warn!("returning unused swap slot failed: {error}");
            }
            return Ok(false);
        }
        *leaf = PageTableEntry::new_swap(slot.locator());
        invalidate_tlb_page(address);
        db.set_saved_swap_entry(pfn, Some(slot));
        db.set_modified(pfn, true);
        db.remove_mapping(pfn, space_id, address);
        drop(db);
        trace!("{space_id}: {address} ({pfn}) paged out to slot {:#x}", slot.locator());
        Ok(true)
    }

    /// The only mapper of an unshared, idle user frame.
    fn sole_user_mapper(db: &PfnDatabase, pfn: Pfn) -> Option<Mapper> {
        let entry = db.entry(pfn);
        let eligible = db.is_in_use(pfn)
            && entry.consumer() == Some(MemoryConsumer::User)
            && entry.usage() == PageUsage::Mapped
            && entry.reference_count() == 1
            && entry.share_count() == 1
            && !entry.flags().io_in_progress();
        if eligible { db.sole_mapper(pfn) } else { None }
    }

    /// Trim callback of the user consumer: page out up to `pages` frames,
    /// oldest first.
    pub fn trim_user_pages(&self, pages: usize) -> usize {
        let mut trimmed = 0;
        let mut budget = self.frames().lru_len();
        let mut candidate = self.frames().lru_first();
        while trimmed < pages && budget > 0 {
            let Some(pfn) = candidate else {
                break;
            };
            budget -= 1;
            candidate = self.frames().lru_next(pfn);
            match self.page_out(pfn) {
                Ok(true) => trimmed += 1,
                Ok(false) => self.frames().lru_touch(pfn),
                Err(error) => {
                    debug!("user trim stopped: {error}");
                    break;
                }
            }
        }
        debug!("user trim: {trimmed} of {pages} pages paged out");
        trimmed
    }

    /// Write up to `max` modified frames to their paging file slots.
    ///
    /// Written anonymous frames become free, written cache frames go to
    /// standby. A frame whose write keeps failing is parked on the
    /// modified-no-write list. Returns the number of frames written; zero if
    /// another writer is running.
    pub fn write_modified_pages(&self, max: usize) -> usize {
        let Some(_writer) = self.writer.try_lock() else {
            return 0;
        };
        let mut written = 0;
        for _ in 0..max {
            let next = {
                let mut db = self.frames();
                loop {
                    let Some(pfn) = db.next_modified() else {
                        break None;
                    };
                    match db.begin_write(pfn) {
                        Some(slot) => break Some((pfn, slot)),
                        None => db.move_frame(pfn, PageLocation::Modified, PageLocation::ModifiedNoWrite),
                    }
                }
            };
            let Some((pfn, slot)) = next else {
                break;
            };
            let io = self.swap.lock().io(slot);
            let result = match io {
                Some(io) => self.with_io_retries(|| {
                    // SAFETY: the frame is unmapped and marked for writing,
                    // so nothing modifies it until `end_write`.
                    io.write_page(slot, unsafe { self.frame_contents(pfn) })
                }),
                None => Err(PageFileError::InvalidLocator(slot.locator())),
            };
            if let Err(error) = result {
                error!("writing {pfn} to slot {:#x} failed: {error}", slot.locator());
            }
            let target = self.frames().end_write(pfn, result.is_ok());
            if result.is_ok() {
                written += 1;
            }
            trace!("{pfn} written to slot {:#x}, now {target:?}", slot.locator());
        }
        if written > 0 {
            debug!("modified page writer: {written} pages written");
        }
        written
    }

    /// Give frames whose write failed another chance. Returns how many were
    /// queued again.
    pub fn requeue_failed_writes(&self) -> usize {
        let mut db = self.frames();
        let mut queued = 0;
        let mut cursor = db.first(PageLocation::ModifiedNoWrite);
        while let Some(pfn) = cursor {
            cursor = db.next_listed(PageLocation::ModifiedNoWrite, pfn);
            if db.saved_swap_entry(pfn).is_some() {
                db.move_frame(pfn, PageLocation::ModifiedNoWrite, PageLocation::Modified);
                queued += 1;
            }
        }
        queued
    }

    /// Zero up to `max` free frames and move them to the zeroed list.
    pub fn zero_free_pages(&self, max: usize) -> usize {
        let mut zeroed = 0;
        while zeroed < max {
            let pfn = {
                let mut db = self.frames();
                let Some(pfn) = db.first(PageLocation::Free) else {
                    break;
                };
                db.remove(PageLocation::Free, pfn);
                pfn
            };
            // In transit: active with no references, invisible to allocation.
            self.zero_frame(pfn);
            self.frames().insert(PageLocation::Zeroed, pfn);
            zeroed += 1;
        }
        zeroed
    }
}
