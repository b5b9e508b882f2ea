use crate::area::AreaTree;
use core::fmt;
use kernel_info::memory::{HIGHEST_USER_ADDRESS, LOWEST_USER_ADDRESS, SYSTEM_RANGE_START};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sync::{TicketGuard, TicketMutex};

/// Names an address space; also stored in reverse mappings.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AddressSpaceId(u32);

impl AddressSpaceId {
    /// The system (kernel) address space.
    pub const KERNEL: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for AddressSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AS({})", self.0)
    }
}

impl fmt::Display for AddressSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SpaceKind {
    /// The system half shared by every process.
    Kernel,
    /// A process's user half.
    Process,
}

impl SpaceKind {
    /// First and last byte this kind of space may map.
    #[must_use]
    pub const fn bounds(self) -> (u64, u64) {
        match self {
            Self::Kernel => (SYSTEM_RANGE_START, u64::MAX),
            Self::Process => (LOWEST_USER_ADDRESS, HIGHEST_USER_ADDRESS),
        }
    }

    #[must_use]
    pub const fn contains(self, va: VirtualAddress) -> bool {
        let (low, high) = self.bounds();
        va.as_u64() >= low && va.as_u64() <= high
    }
}

/// Mutable state of an address space, guarded by its lock.
pub struct SpaceState {
    pub(crate) root: PhysicalAddress,
    pub(crate) areas: AreaTree,
    pub(crate) deleted: bool,
}

impl SpaceState {
    /// PML4 frame.
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    #[must_use]
    pub const fn areas(&self) -> &AreaTree {
        &self.areas
    }

    pub const fn areas_mut(&mut self) -> &mut AreaTree {
        &mut self.areas
    }
}

/// One virtual address space: its page tables and areas.
///
/// The space lock is a FIFO ticket lock. It is taken before the frame lock
/// and may be held across frame allocation.
pub struct AddressSpace {
    id: AddressSpaceId,
    kind: SpaceKind,
    state: TicketMutex<SpaceState>,
}

pub type SpaceGuard<'a> = TicketGuard<'a, SpaceState>;

impl AddressSpace {
    pub(crate) fn new(id: AddressSpaceId, kind: SpaceKind, root: PhysicalAddress) -> Self {
        let (low, high) = kind.bounds();
        Self {
            id,
            kind,
            state: TicketMutex::new(SpaceState {
                root,
                areas: AreaTree::new(VirtualAddress::new(low), VirtualAddress::new(high)),
                deleted: false,
            }),
        }
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> AddressSpaceId {
        self.id
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> SpaceKind {
        self.kind
    }

    pub fn lock(&self) -> SpaceGuard<'_> {
        self.state.lock()
    }

    pub fn try_lock(&self) -> Option<SpaceGuard<'_>> {
        self.state.try_lock()
    }
}
