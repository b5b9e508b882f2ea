//! System address-space layout, computed from the descriptor summary.
//!
//! Everything here is a pure function of its inputs so the layout can be
//! checked on the host without touching page tables.

use crate::config::MmConfig;
use crate::pfn::PfnEntry;
use core::fmt;
use kernel_info::boot::MemoryDescriptor;
use kernel_info::memory::{
    DEFAULT_MAXIMUM_NONPAGED_POOL, HYPER_SPACE, HYPER_SPACE_END, MAX_ADDITION_NONPAGED_POOL_PER_MB,
    MAX_INIT_NONPAGED_POOL_SIZE, MAX_NONPAGED_POOL_SIZE, MIN_ADDITION_NONPAGED_POOL_PER_MB,
    MIN_NONPAGED_POOL_SIZE, MIN_PAGES_FOR_NONPAGED_POOL_TUNING, NON_PAGED_SYSTEM_ALIGNMENT,
    NON_PAGED_SYSTEM_START_MIN, NONPAGED_POOL_END, PAGED_POOL_START, SESSION_SPACE_END,
    SESSION_VIEW_END, SMALL_MACHINE_NONPAGED_POOL,
};
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, VirtualAddress, align_down, align_up};

/// Fewest system PTEs the layout accepts after shrinking the region.
pub const MIN_SYSTEM_PTES: u64 = 1000;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum LayoutError {
    /// No free descriptor to take bootstrap pages from.
    #[error("no free memory descriptor")]
    NoFreeDescriptor,
    /// The PFN database and initial pool exceed the maximum pool size.
    #[error("non-paged pool maximum of {maximum:#x} bytes cannot hold {needed:#x} bytes")]
    NonPagedPoolTooSmall { maximum: u64, needed: u64 },
    /// The non-paged region would start below its minimum address.
    #[error("non-paged region of {0:#x} bytes does not fit")]
    NonPagedPoolTooLarge(u64),
    /// Too few system PTEs remain once the region was clamped.
    #[error("only {0} system PTEs fit")]
    TooFewSystemPtes(u64),
    #[error("paged pool of {0:#x} bytes does not fit")]
    PagedPoolTooLarge(u64),
    /// Session regions overlap each other.
    #[error("session space layout overlaps")]
    SessionOverlap,
}

/// What the descriptor scan found.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct DescriptorSummary {
    pub lowest_page: u64,
    /// Inclusive.
    pub highest_page: u64,
    /// Pages in visible (non-excluded, non-bad) descriptors.
    pub physical_pages: u64,
    /// Pages in free-type descriptors.
    pub free_pages: u64,
    pub descriptor_count: usize,
    /// Index of the largest free-type descriptor.
    pub scratch: Option<usize>,
}

impl DescriptorSummary {
    /// Scan the loader's descriptor list.
    ///
    /// Firmware-permanent, bad-block-table, HAL-cached, special-memory and
    /// bad descriptors are invisible to the totals.
    #[must_use]
    pub fn scan(descriptors: &[MemoryDescriptor]) -> Self {
        let mut summary = Self {
            lowest_page: u64::MAX,
            descriptor_count: descriptors.len(),
            ..Self::default()
        };
        let mut largest = 0;
        for (index, descriptor) in descriptors.iter().enumerate() {
            let kind = descriptor.memory_type;
            if kind.is_excluded() || kind.is_bad() || descriptor.page_count == 0 {
                continue;
            }
            summary.physical_pages += descriptor.page_count;
            summary.lowest_page = summary.lowest_page.min(descriptor.base_page);
            summary.highest_page = summary.highest_page.max(descriptor.end_page() - 1);
            if kind.is_free() {
                summary.free_pages += descriptor.page_count;
                if descriptor.page_count > largest {
                    largest = descriptor.page_count;
                    summary.scratch = Some(index);
                }
            }
        }
        if summary.physical_pages == 0 {
            summary.lowest_page = 0;
        }
        summary
    }

    /// Frame database entries needed to cover every page up to the highest.
    #[must_use]
    pub const fn pfn_entries(&self) -> u64 {
        self.highest_page + 1
    }
}

/// Sizes the layout is computed from.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PoolSizing {
    pub nonpaged_pool_size: Option<u64>,
    pub nonpaged_pool_maximum: Option<u64>,
    pub paged_pool_size: u64,
    pub session_image_size: u64,
    pub session_view_size: u64,
    pub session_pool_size: u64,
    pub system_view_size: u64,
    pub system_ptes: u64,
    /// Size of one frame database entry in bytes.
    pub pfn_entry_size: u64,
}

impl From<&MmConfig> for PoolSizing {
    fn from(config: &MmConfig) -> Self {
        Self {
            nonpaged_pool_size: config.nonpaged_pool_size,
            nonpaged_pool_maximum: config.nonpaged_pool_maximum,
            paged_pool_size: config.paged_pool_size,
            session_image_size: config.session_image_size,
            session_view_size: config.session_view_size,
            session_pool_size: config.session_pool_size,
            system_view_size: config.system_view_size,
            system_ptes: config.system_ptes,
            pfn_entry_size: size_of::<PfnEntry>() as u64,
        }
    }
}

/// A half-open virtual range.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct VirtualRange {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
}

impl VirtualRange {
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self {
            start: VirtualAddress::new(start),
            end: VirtualAddress::new(end),
        }
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    #[must_use]
    pub const fn pages(&self) -> u64 {
        self.size() >> PAGE_SHIFT
    }

    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.start.as_u64() && va.as_u64() < self.end.as_u64()
    }
}

impl fmt::Debug for VirtualRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Boundaries of every system region.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SystemLayout {
    pub pfn_database: VirtualRange,
    pub pfn_entries: u64,
    /// Initial, fully mapped non-paged pool.
    pub nonpaged_pool: VirtualRange,
    /// Expansion range; page tables exist, pages are mapped on demand.
    pub nonpaged_pool_expansion: VirtualRange,
    pub nonpaged_pool_maximum: u64,
    /// System PTE region: kernel stacks and other on-demand system mappings.
    pub system_ptes: VirtualRange,
    pub system_pte_count: u64,
    pub paged_pool: VirtualRange,
    pub system_view: VirtualRange,
    pub session_pool: VirtualRange,
    pub session_view: VirtualRange,
    pub session_image: VirtualRange,
    pub hyper_space: VirtualRange,
}

impl SystemLayout {
    /// Lowest session address.
    #[must_use]
    pub const fn session_base(&self) -> VirtualAddress {
        self.session_pool.start
    }

    /// Whether `va` lies in session space.
    #[must_use]
    pub const fn is_session_address(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.session_pool.start.as_u64() && va.as_u64() < self.session_image.end.as_u64()
    }
}

/// Initial non-paged pool size in bytes.
///
/// Small machines get a fixed pool; an override larger than seven eighths of
/// RAM is ignored; anything below the minimum grows with memory size.
#[must_use]
pub fn initial_nonpaged_pool_size(requested: Option<u64>, pages: u64) -> u64 {
    let mut size = match requested {
        None if pages <= MIN_PAGES_FOR_NONPAGED_POOL_TUNING => SMALL_MACHINE_NONPAGED_POOL,
        None => 0,
        Some(bytes) => bytes,
    };
    if size >> PAGE_SHIFT > pages * 7 / 8 {
        size = 0;
    }
    if size < MIN_NONPAGED_POOL_SIZE {
        size = MIN_NONPAGED_POOL_SIZE + pages.saturating_sub(1024) / 256 * MIN_ADDITION_NONPAGED_POOL_PER_MB;
    }
    align_down(size.min(MAX_INIT_NONPAGED_POOL_SIZE), PAGE_SIZE)
}

/// Maximum non-paged pool size in bytes, before the PFN database is
/// carved out of it.
#[must_use]
pub fn maximum_nonpaged_pool_size(requested: Option<u64>, pages: u64) -> u64 {
    let size = requested.unwrap_or_else(|| {
        DEFAULT_MAXIMUM_NONPAGED_POOL + pages.saturating_sub(1024) / 256 * MAX_ADDITION_NONPAGED_POOL_PER_MB
    });
    align_down(size.min(MAX_NONPAGED_POOL_SIZE), PAGE_SIZE)
}

/// Compute the system layout.
///
/// Order matters: session regions stack down from the session end, the
/// system view sits below the session base, and the non-paged region grows
/// down from its fixed end with the PFN database at its base and the system
/// PTE region below that.
///
/// # Errors
/// A [`LayoutError`] if any region does not fit.
pub fn compute_layout(sizing: &PoolSizing, summary: &DescriptorSummary) -> Result<SystemLayout, LayoutError> {
    if summary.scratch.is_none() {
        return Err(LayoutError::NoFreeDescriptor);
    }

    // Session space, top down.
    let session_image = VirtualRange::new(SESSION_SPACE_END - sizing.session_image_size, SESSION_SPACE_END);
    let view_start = SESSION_VIEW_END - sizing.session_view_size;
    let session_view = VirtualRange::new(view_start, SESSION_VIEW_END);
    let session_pool = VirtualRange::new(view_start - sizing.session_pool_size, view_start);
    if session_view.end.as_u64() > session_image.start.as_u64() {
        return Err(LayoutError::SessionOverlap);
    }
    let system_view = VirtualRange::new(session_pool.start.as_u64() - sizing.system_view_size, session_pool.start.as_u64());

    let paged_end = PAGED_POOL_START
        .checked_add(sizing.paged_pool_size)
        .filter(|end| *end <= system_view.start.as_u64())
        .ok_or(LayoutError::PagedPoolTooLarge(sizing.paged_pool_size))?;
    let paged_pool = VirtualRange::new(PAGED_POOL_START, paged_end);

    // Non-paged region, bottom of which holds the PFN database.
    let initial = initial_nonpaged_pool_size(sizing.nonpaged_pool_size, summary.physical_pages);
    let maximum = maximum_nonpaged_pool_size(sizing.nonpaged_pool_maximum, summary.physical_pages).max(initial);
    let pfn_entries = summary.pfn_entries();
    let pfn_bytes = align_up(pfn_entries * sizing.pfn_entry_size, PAGE_SIZE)
        .ok_or(LayoutError::NonPagedPoolTooLarge(u64::MAX))?;
    let needed = pfn_bytes + initial;
    let region_size = maximum.max(needed);
    if sizing.nonpaged_pool_maximum.is_some() && maximum < needed {
        return Err(LayoutError::NonPagedPoolTooSmall { maximum, needed });
    }
    let region_start = NONPAGED_POOL_END
        .checked_sub(region_size)
        .filter(|start| *start >= NON_PAGED_SYSTEM_START_MIN)
        .ok_or(LayoutError::NonPagedPoolTooLarge(region_size))?;

    let pfn_database = VirtualRange::new(region_start, region_start + pfn_bytes);
    let nonpaged_pool = VirtualRange::new(pfn_database.end.as_u64(), pfn_database.end.as_u64() + initial);
    let nonpaged_pool_expansion = VirtualRange::new(nonpaged_pool.end.as_u64(), NONPAGED_POOL_END);

    // System PTEs below the region, aligned to a page-directory boundary.
    let mut system_pte_count = sizing.system_ptes;
    let wanted = region_start.saturating_sub((system_pte_count + 1) * PAGE_SIZE);
    let mut pte_start = align_down(wanted, NON_PAGED_SYSTEM_ALIGNMENT);
    if pte_start < NON_PAGED_SYSTEM_START_MIN {
        pte_start = NON_PAGED_SYSTEM_START_MIN;
        system_pte_count = ((region_start - pte_start) >> PAGE_SHIFT).saturating_sub(1);
        if system_pte_count <= MIN_SYSTEM_PTES {
            return Err(LayoutError::TooFewSystemPtes(system_pte_count));
        }
    }
    let system_ptes = VirtualRange::new(pte_start, region_start);

    Ok(SystemLayout {
        pfn_database,
        pfn_entries,
        nonpaged_pool,
        nonpaged_pool_expansion,
        nonpaged_pool_maximum: region_size - pfn_bytes,
        system_ptes,
        system_pte_count,
        paged_pool,
        system_view,
        session_pool,
        session_view,
        session_image,
        hyper_space: VirtualRange::new(HYPER_SPACE, HYPER_SPACE_END + 1),
    })
}
