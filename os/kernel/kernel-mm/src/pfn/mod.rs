//! # Page Frame Database
//!
//! One [`PfnEntry`] per physical frame, laid out as a flat array indexed by
//! frame number. Frames that no managed descriptor covers have no entry at
//! all (their part of the array may not even be mapped) and every access is
//! validated against the managed ranges first.
//!
//! ```text
//!             ┌──────────┐  flink   ┌──────────┐  flink   ┌──────────┐
//!  head ────▶ │ PFN 0x20 │ ───────▶ │ PFN 0x21 │ ───────▶ │ PFN 0x90 │ ─┐
//!             └──────────┘ ◀─────── └──────────┘ ◀─────── └──────────┘  │
//!                  ▲          blink                                     │
//!                  └────────────────────────────────────────────────────┘
//! ```
//!
//! Each [`PageLocation`] other than `Active` is a circular list threaded
//! through the entries themselves, so moving a frame never allocates.

mod database;
mod list;
mod storage;
mod transition;

pub use database::{FrameCounts, PfnDatabase, TakenPage, Transition};
pub use list::PageList;
pub use storage::PfnStorage;
pub use transition::SlotTable;

use crate::balancer::MemoryConsumer;
use crate::rmap::RmapIndex;
use crate::space::AddressSpaceId;
use crate::swap::SwapEntry;
use bitfield_struct::bitfield;
use core::fmt;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Opaque handle to a managed physical frame.
///
/// Only the frame database hands these out, so holding one means the frame
/// number was valid when it was issued.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Pfn(u64);

impl Pfn {
    #[inline]
    pub(crate) const fn new(number: u64) -> Self {
        Self(number)
    }

    #[inline]
    #[must_use]
    pub const fn number(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::from_frame_number(self.0)
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PFN(0x{:X})", self.0)
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

/// Where a frame currently lives.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PageLocation {
    /// Free and known to be zero-filled.
    Zeroed,
    /// Free, contents undefined.
    Free,
    /// Clean contents that also exist in backing store; reclaimable.
    Standby,
    /// Dirty contents waiting for the modified page writer.
    Modified,
    /// Dirty contents the writer failed to store.
    ModifiedNoWrite,
    /// Failed memory test; never handed out.
    Bad,
    /// In use: referenced by mappings, page tables or kernel owners.
    Active,
}

impl PageLocation {
    /// Locations that are backed by a page list, in list-array order.
    pub const LISTS: [Self; 6] = [
        Self::Zeroed,
        Self::Free,
        Self::Standby,
        Self::Modified,
        Self::ModifiedNoWrite,
        Self::Bad,
    ];

    /// Index into the list array, `None` for [`PageLocation::Active`].
    #[must_use]
    pub const fn list_index(self) -> Option<usize> {
        match self {
            Self::Zeroed => Some(0),
            Self::Free => Some(1),
            Self::Standby => Some(2),
            Self::Modified => Some(3),
            Self::ModifiedNoWrite => Some(4),
            Self::Bad => Some(5),
            Self::Active => None,
        }
    }
}

/// What a frame is used for; informational only.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PageUsage {
    Unused,
    /// Loader or firmware data still in use after boot.
    Boot,
    PfnDatabase,
    PageTable,
    NonPagedPool,
    KernelStack,
    /// Mapped into an address space on behalf of the mapping layer.
    Mapped,
    /// Owned by a consumer outside the mapping layer.
    Private,
}

/// Per-frame state bits.
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct PfnFlags {
    /// Contents differ from backing store.
    pub modified: bool,
    /// A paging-file read into this frame is in flight.
    pub read_in_progress: bool,
    /// The modified page writer is storing this frame.
    pub write_in_progress: bool,
    /// The frame is described by a prototype (shared) PTE.
    pub prototype_pte: bool,
    #[bits(4)]
    pub page_color: u8,
    /// Retire the frame instead of freeing it once the last reference drops.
    pub removal_requested: bool,
    /// 0 = write-back, 1 = uncached, 2 = write-combined.
    #[bits(2)]
    pub cache_attribute: u8,
    #[bits(5)]
    __: u8,
}

impl PfnFlags {
    #[inline]
    #[must_use]
    pub const fn io_in_progress(&self) -> bool {
        self.read_in_progress() || self.write_in_progress()
    }
}

/// The page table entry that first mapped a frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PteLocation {
    pub space: AddressSpaceId,
    pub address: VirtualAddress,
}

/// Bookkeeping for one managed frame.
#[derive(Debug, Clone)]
pub struct PfnEntry {
    pub(crate) location: PageLocation,
    pub(crate) flink: Option<Pfn>,
    pub(crate) blink: Option<Pfn>,
    pub(crate) pte: Option<PteLocation>,
    pub(crate) reference_count: u32,
    pub(crate) share_count: u32,
    pub(crate) flags: PfnFlags,
    pub(crate) saved_swap: Option<SwapEntry>,
    pub(crate) rmap: Option<RmapIndex>,
    pub(crate) pte_frame: Option<Pfn>,
    pub(crate) consumer: Option<MemoryConsumer>,
    pub(crate) usage: PageUsage,
}

impl PfnEntry {
    pub(crate) const fn new(location: PageLocation, usage: PageUsage) -> Self {
        Self {
            location,
            flink: None,
            blink: None,
            pte: None,
            reference_count: 0,
            share_count: 0,
            flags: PfnFlags::new(),
            saved_swap: None,
            rmap: None,
            pte_frame: None,
            consumer: None,
            usage,
        }
    }

    #[inline]
    #[must_use]
    pub const fn location(&self) -> PageLocation {
        self.location
    }

    #[inline]
    #[must_use]
    pub const fn reference_count(&self) -> u32 {
        self.reference_count
    }

    #[inline]
    #[must_use]
    pub const fn share_count(&self) -> u32 {
        self.share_count
    }

    #[inline]
    #[must_use]
    pub const fn flags(&self) -> PfnFlags {
        self.flags
    }

    #[inline]
    #[must_use]
    pub const fn saved_swap_entry(&self) -> Option<SwapEntry> {
        self.saved_swap
    }

    /// Consumer the frame is charged to, or was last charged to while it
    /// sits on a list.
    #[inline]
    #[must_use]
    pub const fn consumer(&self) -> Option<MemoryConsumer> {
        self.consumer
    }

    #[inline]
    #[must_use]
    pub const fn usage(&self) -> PageUsage {
        self.usage
    }

    #[inline]
    #[must_use]
    pub const fn pte_location(&self) -> Option<PteLocation> {
        self.pte
    }

    #[inline]
    #[must_use]
    pub const fn pte_frame(&self) -> Option<Pfn> {
        self.pte_frame
    }

    #[inline]
    #[must_use]
    pub const fn has_rmap(&self) -> bool {
        self.rmap.is_some()
    }
}
