//! # Kernel Boot Information
//!
//! The loader describes physical memory as an ordered list of
//! [`MemoryDescriptor`]s. The memory manager only ever reads the list, except
//! for the single scratch descriptor it borrows pages from during early
//! bootstrap, which it shrinks before building the frame database.

use kernel_memory_addresses::PhysicalAddress;

/// What the loader used a run of page frames for.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MemoryType {
    /// Unused RAM.
    Free = 0,
    /// RAM that failed testing.
    Bad = 1,
    /// Loaded program image.
    LoadedProgram = 2,
    /// Firmware data that is dead after boot services exit.
    FirmwareTemporary = 3,
    /// Firmware runtime memory.
    FirmwarePermanent = 4,
    OsloaderHeap = 5,
    OsloaderStack = 6,
    SystemCode = 7,
    HalCode = 8,
    BootDriver = 9,
    RegistryData = 10,
    MemoryData = 11,
    NlsData = 12,
    /// Device or otherwise special memory not backed by ordinary RAM.
    SpecialMemory = 13,
    /// Bad-block table memory.
    BbtMemory = 14,
    /// Memory the HAL keeps cached mappings of.
    HalCachedMemory = 15,
}

impl MemoryType {
    /// Ranges the frame database does not describe at all.
    #[must_use]
    pub const fn is_excluded(self) -> bool {
        matches!(
            self,
            Self::FirmwarePermanent | Self::BbtMemory | Self::HalCachedMemory | Self::SpecialMemory
        )
    }

    /// Ranges that become ordinary free pages once the kernel owns the machine.
    #[must_use]
    pub const fn is_free(self) -> bool {
        matches!(
            self,
            Self::Free | Self::LoadedProgram | Self::FirmwareTemporary | Self::OsloaderStack
        )
    }

    #[must_use]
    pub const fn is_bad(self) -> bool {
        matches!(self, Self::Bad)
    }
}

/// A run of physical page frames with a common type.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryDescriptor {
    /// First page frame of the run.
    pub base_page: u64,
    /// Number of page frames.
    pub page_count: u64,
    pub memory_type: MemoryType,
}

impl MemoryDescriptor {
    #[must_use]
    pub const fn new(base_page: u64, page_count: u64, memory_type: MemoryType) -> Self {
        Self {
            base_page,
            page_count,
            memory_type,
        }
    }

    /// One past the last page frame of the run.
    #[must_use]
    pub const fn end_page(&self) -> u64 {
        self.base_page + self.page_count
    }

    #[must_use]
    pub const fn base_address(&self) -> PhysicalAddress {
        PhysicalAddress::from_frame_number(self.base_page)
    }

    #[must_use]
    pub const fn contains(&self, page: u64) -> bool {
        page >= self.base_page && page < self.end_page()
    }
}
