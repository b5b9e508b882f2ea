use kernel_info::memory::{
    DEFAULT_SYSTEM_PTES, MIN_INIT_PAGED_POOL_SIZE, SESSION_IMAGE_SIZE, SESSION_POOL_SIZE,
    SESSION_VIEW_SIZE, SYSTEM_VIEW_SIZE,
};

/// Tunables of the memory manager.
///
/// Every field has a sensible default; the kernel binary overrides individual
/// values from its command line before calling
/// [`MemoryManager::boot`](crate::MemoryManager::boot).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MmConfig {
    /// The balancer trims consumers while free + zeroed + standby pages are
    /// below this many pages.
    pub low_memory_threshold: usize,
    /// How many balancer passes an allocation may trigger before it reports
    /// out-of-memory.
    pub allocation_retries: u32,
    /// Attempts per paging-file read or write before it counts as failed.
    pub io_retries: u32,
    /// Upper bound on pages requested from a single trim callback.
    pub pages_per_trim: usize,
    /// Initial non-paged pool size in bytes; `None` derives it from RAM size.
    pub nonpaged_pool_size: Option<u64>,
    /// Maximum non-paged pool size in bytes; `None` derives it from RAM size.
    pub nonpaged_pool_maximum: Option<u64>,
    /// Paged pool size in bytes.
    pub paged_pool_size: u64,
    pub session_image_size: u64,
    pub session_view_size: u64,
    pub session_pool_size: u64,
    pub system_view_size: u64,
    /// Requested number of system PTEs; may shrink to fit the region.
    pub system_ptes: u64,
}

impl Default for MmConfig {
    fn default() -> Self {
        Self {
            low_memory_threshold: 256,
            allocation_retries: 3,
            io_retries: 3,
            pages_per_trim: 1024,
            nonpaged_pool_size: None,
            nonpaged_pool_maximum: None,
            paged_pool_size: MIN_INIT_PAGED_POOL_SIZE,
            session_image_size: SESSION_IMAGE_SIZE,
            session_view_size: SESSION_VIEW_SIZE,
            session_pool_size: SESSION_POOL_SIZE,
            system_view_size: SYSTEM_VIEW_SIZE,
            system_ptes: DEFAULT_SYSTEM_PTES,
        }
    }
}
