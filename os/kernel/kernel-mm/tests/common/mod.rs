#![allow(dead_code)]

use kernel_info::boot::{MemoryDescriptor, MemoryType};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_mm::area::{AreaFlags, AreaKind};
use kernel_mm::pfn::PfnStorage;
use kernel_mm::swap::Page;
use kernel_mm::{
    AccessKind, AddressSpace, FaultContext, FaultResolution, MemoryManager, MmConfig, MmError,
    PageFileError, PageFileIo, ProcessorMode, Protection, SwapEntry,
};
use kernel_vmem::PhysMapper;
use kernel_vmem::sim::SimulatedRam;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

pub type Mm = MemoryManager<SimulatedRam>;

/// Frame holding the kernel PML4; inside the loader heap descriptor.
pub const KERNEL_ROOT_FRAME: u64 = 0x20;

/// Config with a small initial pool so little machines boot.
pub fn config() -> MmConfig {
    MmConfig {
        nonpaged_pool_size: Some(256 * 1024),
        ..MmConfig::default()
    }
}

pub fn boot(free_pages: u64) -> Mm {
    boot_with(config(), free_pages)
}

/// Firmware at frames 0..0x10, loader heap (with the kernel root) up to
/// 0x100, then `free_pages` of free RAM.
pub fn boot_with(config: MmConfig, free_pages: u64) -> Mm {
    boot_on(SimulatedRam::new(), config, free_pages)
}

/// [`boot_with`] over any physical memory view.
pub fn boot_on<M: PhysMapper + 'static>(mapper: M, config: MmConfig, free_pages: u64) -> MemoryManager<M> {
    let mut descriptors = [
        MemoryDescriptor::new(0, 0x10, MemoryType::FirmwarePermanent),
        MemoryDescriptor::new(0x10, 0xF0, MemoryType::OsloaderHeap),
        MemoryDescriptor::new(0x100, free_pages, MemoryType::Free),
    ];
    let root = PhysicalAddress::from_frame_number(KERNEL_ROOT_FRAME);
    #[allow(clippy::cast_possible_truncation)]
    let storage = |layout: &kernel_mm::bootstrap::SystemLayout| PfnStorage::boxed(layout.pfn_entries as usize);
    unsafe { MemoryManager::boot(mapper, config, root, &mut descriptors, storage) }.unwrap()
}

pub fn user(space: &AddressSpace) -> FaultContext<'_> {
    FaultContext::new(space, ProcessorMode::User)
}

pub fn kernel(space: &AddressSpace) -> FaultContext<'_> {
    FaultContext::new(space, ProcessorMode::Kernel)
}

/// Reserve `pages` of private memory at `base` in `space`.
pub fn private_area(mm: &Mm, space: &AddressSpace, base: u64, pages: u64, protection: Protection) -> VirtualAddress {
    mm.create_area(
        space,
        AreaKind::VirtualMemory,
        Some(VirtualAddress::new(base)),
        pages * PAGE_SIZE,
        protection,
        AreaFlags::new(),
    )
    .unwrap()
}

pub fn touch(mm: &Mm, space: &AddressSpace, va: VirtualAddress, access: AccessKind) -> Result<FaultResolution, MmError> {
    mm.handle_fault(va, access, user(space))
}

pub fn read_u64(mm: &Mm, space: &AddressSpace, va: VirtualAddress) -> u64 {
    let mut bytes = [0; 8];
    mm.copy_from_space(space, va, &mut bytes).unwrap();
    u64::from_le_bytes(bytes)
}

pub fn write_u64(mm: &Mm, space: &AddressSpace, va: VirtualAddress, value: u64) {
    mm.copy_to_space(space, va, &value.to_le_bytes()).unwrap();
}

pub fn verify(mm: &Mm) {
    mm.with_frames(|db| db.verify());
}

/// Paging file kept in a hash map, with injectable failures.
#[derive(Default)]
pub struct MemoryPageFile {
    pages: Mutex<HashMap<u64, Box<Page>>>,
    /// Reads that fail before the next one succeeds.
    pub failing_reads: AtomicU32,
    /// Writes that fail before the next one succeeds.
    pub failing_writes: AtomicU32,
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
}

impl MemoryPageFile {
    pub fn stored(&self) -> usize {
        self.pages.lock().unwrap().len()
    }

    pub fn contents(&self, entry: SwapEntry) -> Option<Box<Page>> {
        self.pages.lock().unwrap().get(&entry.locator()).cloned()
    }

    fn fail(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl PageFileIo for MemoryPageFile {
    fn read_page(&self, entry: SwapEntry, page: &mut Page) -> Result<(), PageFileError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if Self::fail(&self.failing_reads) {
            return Err(PageFileError::Io(entry.locator()));
        }
        match self.pages.lock().unwrap().get(&entry.locator()) {
            Some(stored) => page.copy_from_slice(stored.as_slice()),
            None => page.fill(0),
        }
        Ok(())
    }

    fn write_page(&self, entry: SwapEntry, page: &Page) -> Result<(), PageFileError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if Self::fail(&self.failing_writes) {
            return Err(PageFileError::Io(entry.locator()));
        }
        self.pages.lock().unwrap().insert(entry.locator(), Box::new(*page));
        Ok(())
    }
}
