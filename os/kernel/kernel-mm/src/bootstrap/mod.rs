//! # Page-Table Bootstrap
//!
//! Runs once, single-threaded, before the frame database exists:
//!
//! 1. Scan the loader descriptors ([`DescriptorSummary::scan`]).
//! 2. Compute the system layout ([`compute_layout`]).
//! 3. Map and zero the PFN database pages that describe managed frames.
//! 4. Map and zero the initial non-paged pool; create the page tables of
//!    the expansion range; preallocate the shared kernel PML4 slots.
//! 5. Give the unused rest of the scratch descriptor back.
//!
//! Every frame needed along the way comes from a bump allocator over the
//! largest free descriptor. Running out of it is fatal.

mod layout;

pub use layout::{
    DescriptorSummary, LayoutError, MIN_SYSTEM_PTES, PoolSizing, SystemLayout, VirtualRange,
    compute_layout, initial_nonpaged_pool_size, maximum_nonpaged_pool_size,
};

use crate::config::MmConfig;
use crate::error::{BugCheckCode, MmError, bug_check};
use crate::pfn::{PageLocation, PageUsage, PfnDatabase};
use crate::protection::Protection;
use core::ops::Range;
use kernel_info::boot::MemoryDescriptor;
use kernel_info::memory::{NONPAGED_POOL_END, PAGED_POOL_START};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, align_down, align_up};
use kernel_vmem::{FrameAlloc, PageTableWalker, PhysMapper, TableLevel};
use log::{debug, info};

/// Hands out the pages of the scratch descriptor in ascending order.
pub struct BumpAllocator {
    start: u64,
    next: u64,
    end: u64,
    descriptor_count: usize,
    requested: u64,
}

impl BumpAllocator {
    #[must_use]
    pub const fn new(descriptor: &MemoryDescriptor, descriptor_count: usize) -> Self {
        Self {
            start: descriptor.base_page,
            next: descriptor.base_page,
            end: descriptor.end_page(),
            descriptor_count,
            requested: 0,
        }
    }

    /// Next page frame number; `INSTALL_MORE_MEMORY` once the descriptor
    /// is exhausted.
    pub fn next_page(&mut self) -> u64 {
        self.requested += 1;
        if self.next >= self.end {
            bug_check(
                BugCheckCode::InstallMoreMemory,
                [
                    self.end - self.start,
                    self.descriptor_count as u64,
                    self.end - self.start,
                    self.requested,
                ],
            );
        }
        let page = self.next;
        self.next += 1;
        page
    }

    /// Frames handed out so far.
    #[must_use]
    pub const fn consumed(&self) -> Range<u64> {
        self.start..self.next
    }

    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.end - self.next
    }
}

impl FrameAlloc for BumpAllocator {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        Some(PhysicalAddress::from_frame_number(self.next_page()))
    }
}

/// What the bootstrap built.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BootImage {
    pub layout: SystemLayout,
    pub summary: DescriptorSummary,
    /// Frames the bootstrap took from the scratch descriptor.
    pub bootstrap_frames: Range<u64>,
}

/// Build the system page tables on `root`.
///
/// On success the scratch descriptor in `descriptors` has been shrunk to
/// what the bootstrap left unused.
///
/// # Errors
/// [`MmError::Layout`] if the layout does not fit the machine, or a walker
/// error if an existing large page covers a system range.
///
/// # Safety
/// `root` must be the kernel PML4 and every frame the loader reports must
/// be reachable through `mapper`. Must run before any other user of the
/// scratch descriptor's free pages.
pub unsafe fn build_page_tables<M: PhysMapper>(
    mapper: &M,
    root: PhysicalAddress,
    config: &MmConfig,
    descriptors: &mut [MemoryDescriptor],
) -> Result<BootImage, MmError> {
    let summary = DescriptorSummary::scan(descriptors);
    let layout = compute_layout(&PoolSizing::from(config), &summary)?;
    let scratch = summary.scratch.ok_or(LayoutError::NoFreeDescriptor)?;
    info!(
        "{} physical pages in {} descriptors, frames {:#x}..={:#x}",
        summary.physical_pages, summary.descriptor_count, summary.lowest_page, summary.highest_page
    );
    debug!("system layout: {layout:#?}");

    let mut bump = BumpAllocator::new(&descriptors[scratch], descriptors.len());
    let mut walker = PageTableWalker::new(mapper, root);
    walker.clear_user_half();

    // Shared kernel slots exist up front so every process root copies them.
    let first = TableLevel::Pml4.index_of(VirtualAddress::new(PAGED_POOL_START));
    let last = TableLevel::Pml4.index_of(VirtualAddress::new(NONPAGED_POOL_END - 1));
    for slot in first..=last {
        let va = VirtualAddress::canonicalize((slot as u64) << TableLevel::Pml4.shift());
        walker.ensure_entry(va, TableLevel::Pdpt, &mut bump)?;
    }

    let entry_size = size_of::<crate::pfn::PfnEntry>() as u64;
    let mut pfn_pages = 0;
    for descriptor in descriptors.iter().filter(|d| !d.memory_type.is_excluded()) {
        let end_page = descriptor.end_page().min(layout.pfn_entries);
        if descriptor.base_page >= end_page {
            continue;
        }
        let db = layout.pfn_database.start.as_u64();
        let start = align_down(db + descriptor.base_page * entry_size, PAGE_SIZE);
        let end = align_up(db + end_page * entry_size, PAGE_SIZE).unwrap_or(layout.pfn_database.end.as_u64());
        for va in (start..end).step_by(PAGE_SIZE as usize) {
            if map_zeroed(&mut walker, &mut bump, VirtualAddress::new(va))? {
                pfn_pages += 1;
            }
        }
    }
    info!("PFN database: {pfn_pages} pages mapped at {:?}", layout.pfn_database);

    let pool = layout.nonpaged_pool;
    for va in (pool.start.as_u64()..pool.end.as_u64()).step_by(PAGE_SIZE as usize) {
        map_zeroed(&mut walker, &mut bump, VirtualAddress::new(va))?;
    }
    let table_span = 1u64 << TableLevel::Pd.shift();
    let expansion = layout.nonpaged_pool_expansion;
    let mut va = align_down(expansion.start.as_u64(), table_span);
    while va < expansion.end.as_u64() {
        walker.ensure_leaf(VirtualAddress::new(va), &mut bump)?;
        va += table_span;
    }
    info!("non-paged pool: {:?} mapped, expansion {:?}", pool, expansion);

    let scratch_descriptor = &mut descriptors[scratch];
    scratch_descriptor.base_page = bump.next;
    scratch_descriptor.page_count = bump.remaining();
    info!(
        "bootstrap used {} pages, {} left in the scratch descriptor",
        bump.consumed().end - bump.consumed().start,
        scratch_descriptor.page_count
    );

    Ok(BootImage {
        layout,
        summary,
        bootstrap_frames: bump.consumed(),
    })
}

/// Map a fresh zeroed page at `va` unless one is already there.
fn map_zeroed<M: PhysMapper>(
    walker: &mut PageTableWalker<'_, M>,
    bump: &mut BumpAllocator,
    va: VirtualAddress,
) -> Result<bool, MmError> {
    if walker.leaf(va).is_some_and(|e| e.present()) {
        return Ok(false);
    }
    let frame = PhysicalAddress::from_frame_number(bump.next_page());
    // SAFETY: the frame was just taken from the scratch descriptor and is
    // not referenced anywhere else.
    unsafe { walker.mapper().phys_to_mut::<[u8; PAGE_SIZE as usize]>(frame) }.fill(0);
    *walker.ensure_leaf(va, bump)? = Protection::READ_WRITE.to_entry(frame, false);
    Ok(true)
}

/// Create a frame database entry for every visible frame.
///
/// Free-type descriptors go to the free list, bad ones to the bad list,
/// everything else (and the bootstrap's own allocations) starts active.
pub fn populate(db: &mut PfnDatabase, descriptors: &[MemoryDescriptor], image: &BootImage) {
    let limit = image.layout.pfn_entries;
    for descriptor in descriptors.iter().filter(|d| !d.memory_type.is_excluded()) {
        let end = descriptor.end_page().min(limit);
        if descriptor.base_page >= end {
            continue;
        }
        let count = end - descriptor.base_page;
        let kind = descriptor.memory_type;
        let (location, usage) = if kind.is_bad() {
            (PageLocation::Bad, PageUsage::Unused)
        } else if kind.is_free() {
            (PageLocation::Free, PageUsage::Unused)
        } else {
            (PageLocation::Active, PageUsage::Boot)
        };
        db.add_range(descriptor.base_page, count, location, usage);
    }
    let taken = &image.bootstrap_frames;
    db.add_range(taken.start, taken.end - taken.start, PageLocation::Active, PageUsage::Boot);
    db.finish_init();

    let counts = db.counts();
    info!(
        "frame database: {} tracked, {} free, {} active, {} bad",
        counts.tracked, counts.free, counts.active, counts.bad
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::MemoryType;

    #[test]
    #[should_panic(expected = "INSTALL_MORE_MEMORY")]
    fn exhausted_bump_allocator_is_fatal() {
        let descriptor = MemoryDescriptor::new(0x100, 2, MemoryType::Free);
        let mut bump = BumpAllocator::new(&descriptor, 1);
        assert_eq!(bump.next_page(), 0x100);
        assert_eq!(bump.next_page(), 0x101);
        assert_eq!(bump.consumed(), 0x100..0x102);
        bump.next_page();
    }
}
