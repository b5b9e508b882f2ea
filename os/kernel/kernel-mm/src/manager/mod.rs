//! # The memory manager service object
//!
//! [`MemoryManager`] owns the frame database, the address spaces, the paging
//! files and the consumer registrations. It is built once by
//! [`MemoryManager::boot`] and then shared by reference (the kernel keeps it
//! in [`install_system`]'s once cell).
//!
//! ## Locks
//!
//! ```text
//!   space lock (TicketMutex, per address space)
//!     └── frame lock (SpinLock, interrupts off)
//!   paging-file lock (SpinLock, leaf)
//!   writer lock (SpinLock, try_lock only, serializes the modified page writer)
//!   balancing lock (SpinLock, try_lock only, one pass at a time)
//! ```
//!
//! A space lock may be held while frames are allocated, which may run the
//! balancer; the balancer only ever *tries* to lock another space. The frame
//! lock is never held across I/O, a callback or while taking a space lock.

mod areas;
mod balance;
mod fault;
mod mapping;
mod paging;
mod shared;
mod spaces;
mod stack;

pub use areas::FreedArea;
pub use fault::{FaultContext, FaultResolution, ProcessorMode};

use crate::area::{AreaFlags, AreaKind, MemoryArea};
use crate::balancer::{BalancerWaiter, ConsumerSlot, MemoryConsumer, TrimCallback};
use crate::bootstrap::{self, SystemLayout, VirtualRange};
use crate::config::MmConfig;
use crate::error::{BugCheckCode, MmError, bug_check};
use crate::phys_mapper::HhdmPhysMapper;
use crate::pfn::{FrameCounts, PageUsage, Pfn, PfnDatabase, PfnStorage};
use crate::protection::Protection;
use crate::space::{AddressSpace, AddressSpaceId, SpaceKind};
use crate::swap::{Page, PagingFiles, SwapEntry};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use kernel_info::boot::MemoryDescriptor;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sync::{IrqSpinLockGuard, SpinLock, SyncOnceCell, context};
use kernel_vmem::{FrameAlloc, PageTableWalker, PhysMapper};
use log::{debug, info, warn};

/// The system-wide instance.
static SYSTEM: SyncOnceCell<MemoryManager<HhdmPhysMapper>> = SyncOnceCell::new();

/// Publish the booted memory manager.
///
/// # Errors
/// Hands the manager back if one was installed already.
pub fn install_system(
    mm: MemoryManager<HhdmPhysMapper>,
) -> Result<&'static MemoryManager<HhdmPhysMapper>, MemoryManager<HhdmPhysMapper>> {
    SYSTEM.set(mm)?;
    SYSTEM.get().ok_or_else(|| bug_check(BugCheckCode::MemoryManagementInvalid, [0, 0, 0, 4]))
}

/// The installed memory manager, if boot got that far.
#[must_use]
pub fn system() -> Option<&'static MemoryManager<HhdmPhysMapper>> {
    SYSTEM.get()
}

pub struct MemoryManager<M: PhysMapper> {
    mapper: M,
    config: MmConfig,
    layout: SystemLayout,
    frames: SpinLock<PfnDatabase>,
    spaces: SpinLock<BTreeMap<AddressSpaceId, Arc<AddressSpace>>>,
    next_space_id: AtomicU32,
    kernel: Arc<AddressSpace>,
    swap: SpinLock<PagingFiles>,
    consumers: SpinLock<[ConsumerSlot<M>; MemoryConsumer::COUNT]>,
    writer: SpinLock<()>,
    balancing: SpinLock<()>,
    /// Context running the current balancing pass, if any.
    balance_owner: AtomicUsize,
    /// Completed balancing passes.
    balance_passes: AtomicU64,
    waiter: SyncOnceCell<Arc<dyn BalancerWaiter + Send + Sync>>,
    low_memory: AtomicBool,
}

impl MemoryManager<HhdmPhysMapper> {
    /// Boot on real hardware: the frame database lives at its reserved
    /// virtual range, which the bootstrap has just mapped.
    ///
    /// # Errors
    /// See [`MemoryManager::boot`].
    ///
    /// # Safety
    /// As for [`MemoryManager::boot`]; additionally `kernel_root` must be
    /// the active page table root so the freshly mapped database is
    /// reachable.
    pub unsafe fn boot_system(
        config: MmConfig,
        kernel_root: PhysicalAddress,
        descriptors: &mut [MemoryDescriptor],
    ) -> Result<Self, MmError> {
        // SAFETY: forwarded from the caller.
        unsafe {
            Self::boot(HhdmPhysMapper, config, kernel_root, descriptors, |layout| {
                let base = NonNull::new(layout.pfn_database.start.as_mut_ptr()).unwrap_or_else(|| {
                    bug_check(BugCheckCode::MemoryManagementInvalid, [0, 0, 0, 5])
                });
                #[allow(clippy::cast_possible_truncation)]
                let len = layout.pfn_entries as usize;
                PfnStorage::from_raw(base, len)
            })
        }
    }
}

impl<M: PhysMapper> MemoryManager<M> {
    /// Bootstrap the page tables, build the frame database and set up the
    /// kernel address space.
    ///
    /// `storage` provides the backing array for `layout.pfn_entries` frame
    /// entries once the layout is known.
    ///
    /// # Errors
    /// [`MmError::Layout`] if the machine's memory cannot be laid out.
    ///
    /// # Safety
    /// See [`bootstrap::build_page_tables`]. Must be called once, before any
    /// other processor or thread touches memory management.
    pub unsafe fn boot(
        mapper: M,
        config: MmConfig,
        kernel_root: PhysicalAddress,
        descriptors: &mut [MemoryDescriptor],
        storage: impl FnOnce(&SystemLayout) -> PfnStorage,
    ) -> Result<Self, MmError>
    where
        M: 'static,
    {
        // SAFETY: forwarded from the caller.
        let image = unsafe { bootstrap::build_page_tables(&mapper, kernel_root, &config, descriptors)? };
        let storage = storage(&image.layout);
        if (storage.len() as u64) < image.layout.pfn_entries {
            bug_check(
                BugCheckCode::MemoryManagementInvalid,
                [storage.len() as u64, image.layout.pfn_entries, 0, 6],
            );
        }
        let mut db = PfnDatabase::new(storage);
        bootstrap::populate(&mut db, descriptors, &image);
        db.rmap_reserve(db.available() / 4);

        let kernel = Arc::new(AddressSpace::new(AddressSpaceId::KERNEL, SpaceKind::Kernel, kernel_root));
        {
            let mut state = kernel.lock();
            let layout = &image.layout;
            let nonpaged = VirtualRange {
                start: layout.nonpaged_pool.start,
                end: layout.nonpaged_pool_expansion.end,
            };
            for range in [layout.pfn_database, nonpaged, layout.paged_pool, layout.hyper_space] {
                let area = MemoryArea::new(
                    range.start.page_number(),
                    range.pages(),
                    AreaKind::System,
                    Protection::READ_WRITE,
                    AreaFlags::new().with_is_static(true).with_locked(true),
                );
                if state.areas_mut().insert(area).is_err() {
                    return Err(MmError::AreaConflict(range.start));
                }
            }
        }

        let available = db.available();
        let mut consumers = [const { ConsumerSlot::new() }; MemoryConsumer::COUNT];
        consumers[MemoryConsumer::Cache.index()].target = available / 2;
        consumers[MemoryConsumer::User.index()].target = available.saturating_sub(config.low_memory_threshold);
        let user_trim: TrimCallback<M> = Arc::new(|mm: &Self, pages| mm.trim_user_pages(pages));
        consumers[MemoryConsumer::User.index()].trim = Some(user_trim);
        info!("memory manager up: {available} pages available");

        let mut spaces = BTreeMap::new();
        spaces.insert(AddressSpaceId::KERNEL, Arc::clone(&kernel));
        Ok(Self {
            mapper,
            config,
            layout: image.layout,
            frames: SpinLock::new(db),
            spaces: SpinLock::new(spaces),
            next_space_id: AtomicU32::new(1),
            kernel,
            swap: SpinLock::new(PagingFiles::new()),
            consumers: SpinLock::new(consumers),
            writer: SpinLock::new(()),
            balancing: SpinLock::new(()),
            balance_owner: AtomicUsize::new(context::NO_CONTEXT),
            balance_passes: AtomicU64::new(0),
            waiter: SyncOnceCell::new(),
            low_memory: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[must_use]
    pub const fn config(&self) -> &MmConfig {
        &self.config
    }

    #[must_use]
    pub const fn layout(&self) -> &SystemLayout {
        &self.layout
    }

    /// The system address space.
    #[must_use]
    pub const fn kernel_space(&self) -> &Arc<AddressSpace> {
        &self.kernel
    }

    /// Look up a live address space.
    #[must_use]
    pub fn space(&self, id: AddressSpaceId) -> Option<Arc<AddressSpace>> {
        self.spaces.lock().get(&id).cloned()
    }

    #[must_use]
    pub fn is_session_address(&self, va: VirtualAddress) -> bool {
        self.layout.is_session_address(va)
    }

    /// Whether the last balancing pass failed to reach the threshold.
    #[must_use]
    pub fn low_memory(&self) -> bool {
        self.low_memory.load(Ordering::Acquire)
    }

    #[inline]
    fn frames(&self) -> IrqSpinLockGuard<'_, PfnDatabase> {
        self.frames.lock_irq()
    }

    /// Run `f` with the frame database locked, for inspection.
    pub fn with_frames<R>(&self, f: impl FnOnce(&PfnDatabase) -> R) -> R {
        f(&self.frames())
    }

    #[must_use]
    pub fn frame_counts(&self) -> FrameCounts {
        self.frames().counts()
    }

    /// Validate a physical address as a managed frame.
    #[must_use]
    pub fn pfn_of(&self, pa: PhysicalAddress) -> Option<Pfn> {
        self.frames().pfn(pa.frame_number())
    }

    fn walker(&self, root: PhysicalAddress) -> PageTableWalker<'_, M> {
        PageTableWalker::new(&self.mapper, root)
    }

    /// Allocate a frame charged to `consumer`; contents are undefined.
    ///
    /// Falls back to the standby list, then to synchronous balancing, which
    /// is retried [`MmConfig::allocation_retries`] times.
    ///
    /// # Errors
    /// [`MmError::OutOfMemory`] once the retries are used up.
    pub fn allocate(&self, consumer: MemoryConsumer) -> Result<Pfn, MmError> {
        self.allocate_frame(consumer, PageUsage::Private, false)
    }

    /// Like [`allocate`](Self::allocate), but the frame is zero-filled.
    ///
    /// # Errors
    /// [`MmError::OutOfMemory`] once the retries are used up.
    pub fn allocate_zeroed(&self, consumer: MemoryConsumer) -> Result<Pfn, MmError> {
        self.allocate_frame(consumer, PageUsage::Private, true)
    }

    /// Allocation for paths that cannot fail; stops the system otherwise.
    pub fn request_page_must_succeed(&self, consumer: MemoryConsumer) -> Pfn {
        self.allocate_frame(consumer, PageUsage::Private, true)
            .unwrap_or_else(|_| {
                let counts = self.frame_counts();
                bug_check(
                    BugCheckCode::NoPagesAvailable,
                    [
                        consumer.index() as u64,
                        counts.available() as u64,
                        counts.modified as u64,
                        counts.tracked as u64,
                    ],
                )
            })
    }

    fn allocate_frame(&self, consumer: MemoryConsumer, usage: PageUsage, zeroed: bool) -> Result<Pfn, MmError> {
        let retries = self.config.allocation_retries;
        for attempt in 0..=retries {
            let taken = self.frames().take_page(consumer, usage);
            if let Some(page) = taken {
                if zeroed && !page.zeroed {
                    self.zero_frame(page.pfn);
                }
                if self.frames().available() < self.config.low_memory_threshold {
                    self.wake_balancer();
                }
                return Ok(page.pfn);
            }
            if attempt < retries {
                debug!("no free frame for {consumer}, balancing (attempt {})", attempt + 1);
                self.balance();
            }
        }
        warn!("out of memory allocating for {consumer}");
        Err(MmError::OutOfMemory)
    }

    /// Release the caller's reference.
    pub fn free(&self, pfn: Pfn) {
        self.frames().dereference(pfn);
    }

    pub fn reference(&self, pfn: Pfn) {
        self.frames().reference(pfn);
    }

    /// Drop a reference; returns the remaining count.
    pub fn dereference(&self, pfn: Pfn) -> u32 {
        self.frames().dereference(pfn).0
    }

    #[must_use]
    pub fn get_reference_count(&self, pfn: Pfn) -> u32 {
        self.frames().reference_count(pfn)
    }

    /// Whether the frame is active and referenced.
    #[must_use]
    pub fn is_page_in_use(&self, pfn: Pfn) -> bool {
        self.frames().is_in_use(pfn)
    }

    #[must_use]
    pub fn get_saved_swap_entry(&self, pfn: Pfn) -> Option<SwapEntry> {
        self.frames().saved_swap_entry(pfn)
    }

    /// Record where the frame's contents are kept in backing store.
    pub fn set_saved_swap_entry(&self, pfn: Pfn, entry: Option<SwapEntry>) {
        self.frames().set_saved_swap_entry(pfn, entry);
    }

    /// Retire a frame: now if it is free, once released otherwise.
    pub fn request_frame_removal(&self, pfn: Pfn) {
        self.frames().request_removal(pfn);
    }

    /// Direct view of a frame's contents.
    ///
    /// # Safety
    /// The caller must own the frame (hold a reference nobody else writes
    /// through) for the duration of the borrow.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn frame_contents(&self, pfn: Pfn) -> &mut Page {
        // SAFETY: guaranteed by the caller.
        unsafe { self.mapper.phys_to_mut::<Page>(pfn.physical_address()) }
    }

    pub(crate) fn zero_frame(&self, pfn: Pfn) {
        // SAFETY: callers only zero frames they exclusively own.
        unsafe { self.frame_contents(pfn) }.fill(0);
    }

    pub(crate) fn copy_frame(&self, from: Pfn, to: Pfn) {
        // SAFETY: `to` is freshly allocated; `from` is only read.
        let source = unsafe { *self.frame_contents(from) };
        unsafe { self.frame_contents(to) }.copy_from_slice(&source);
    }

    /// Page-table frames for the walker, charged to the system consumer.
    fn table_frames(&self) -> TableFrames<'_, M> {
        TableFrames { mm: self }
    }

    /// Frame of the page table mapping `va`, if the database tracks it.
    fn pte_frame(&self, walker: &PageTableWalker<'_, M>, va: VirtualAddress) -> Option<Pfn> {
        let table = walker.leaf_table(va)?;
        self.frames().pfn(table.frame_number())
    }
}

/// [`FrameAlloc`] over the frame database for lazily created page tables.
struct TableFrames<'a, M: PhysMapper> {
    mm: &'a MemoryManager<M>,
}

impl<M: PhysMapper> FrameAlloc for TableFrames<'_, M> {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        self.mm
            .allocate_frame(MemoryConsumer::System, PageUsage::PageTable, false)
            .ok()
            .map(Pfn::physical_address)
    }
}
