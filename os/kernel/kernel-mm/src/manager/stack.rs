use super::MemoryManager;
use super::mapping::NewPage;
use crate::area::{AreaFlags, AreaKind, MemoryArea, PageDisposition, RegionState};
use crate::balancer::MemoryConsumer;
use crate::error::MmError;
use crate::pfn::PageUsage;
use crate::protection::Protection;
use crate::space::AddressSpaceId;
use kernel_info::memory::{KERNEL_LARGE_STACK_SIZE, KERNEL_STACK_SIZE};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_vmem::PhysMapper;
use log::debug;

const fn stack_pages(large: bool) -> u64 {
    (if large { KERNEL_LARGE_STACK_SIZE } else { KERNEL_STACK_SIZE }) / PAGE_SIZE
}

impl<M: PhysMapper> MemoryManager<M> {
    /// Allocate a kernel stack in the system PTE region and return its top.
    ///
    /// The page below the stack is a reserved guard page, so an overflow
    /// faults instead of corrupting the neighbour.
    ///
    /// # Errors
    /// [`MmError::NoVirtualSpace`] if the region is full,
    /// [`MmError::OutOfMemory`] if the stack pages could not be allocated.
    pub fn create_kernel_stack(&self, large: bool) -> Result<VirtualAddress, MmError> {
        let pages = stack_pages(large);
        let size = pages * PAGE_SIZE;
        let region = self.layout.system_ptes;
        let mut state = self.kernel.lock();
        let start = state
            .areas
            .find_gap_in(pages + 1, 1, true, region.start.page_number(), region.end.page_number())
            .ok_or(MmError::NoVirtualSpace(size))?;

        let mut area = MemoryArea::new(
            start,
            pages + 1,
            AreaKind::KernelStack,
            Protection::READ_WRITE,
            AreaFlags::new().with_locked(true),
        );
        area.regions_mut()
            .alter(start, start + 1, RegionState::Reserved, Protection::NO_ACCESS);
        let base = area.start();
        state
            .areas
            .insert(area)
            .map_err(|_| MmError::NoVirtualSpace(size))?;

        for page in 1..=pages {
            let stack_page = NewPage {
                protection: Protection::READ_WRITE,
                consumer: MemoryConsumer::System,
                usage: PageUsage::KernelStack,
                dirty: false,
            };
            let va = (start + page).base();
            if let Err(error) = self.map_new_frame_locked(AddressSpaceId::KERNEL, &mut state, va, stack_page) {
                self.free_area_locked(AddressSpaceId::KERNEL, &mut state, base, &mut |_| PageDisposition::Discard)?;
                return Err(error);
            }
        }
        let top = (start + pages + 1).base();
        debug!("kernel stack {base}..{top} ({pages} pages + guard)");
        Ok(top)
    }

    /// Release a stack returned by [`create_kernel_stack`](Self::create_kernel_stack).
    ///
    /// # Errors
    /// [`MmError::InvalidAddress`] if `top` is not the top of a kernel stack
    /// of that size.
    pub fn delete_kernel_stack(&self, top: VirtualAddress, large: bool) -> Result<(), MmError> {
        let pages = stack_pages(large) + 1;
        let base = top
            .page_number()
            .checked_sub(pages)
            .map(|vpn| vpn.base())
            .ok_or(MmError::InvalidAddress(top))?;
        let mut state = self.kernel.lock();
        let is_stack = state
            .areas
            .find_by_address(base)
            .is_some_and(|a| a.kind() == AreaKind::KernelStack && a.start() == base && a.pages() == pages);
        if !is_stack {
            return Err(MmError::InvalidAddress(top));
        }
        let freed = self.free_area_locked(AddressSpaceId::KERNEL, &mut state, base, &mut |_| PageDisposition::Discard)?;
        debug!("kernel stack at {base} released, {} frames", freed.released);
        Ok(())
    }
}
