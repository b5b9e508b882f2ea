//! # Memory Layout

/// Lowest address a user mapping may start at; the first 64 KiB stay unmapped
/// so null-pointer dereferences always fault.
pub const LOWEST_USER_ADDRESS: u64 = 0x0000_0000_0001_0000;

/// Last byte of the user address range.
pub const HIGHEST_USER_ADDRESS: u64 = 0x0000_07FF_FFFE_FFFF;

/// First address user-mode probes must reject.
pub const USER_PROBE_ADDRESS: u64 = 0x0000_07FF_FFFF_0000;

/// Start of the kernel half of the address space.
pub const SYSTEM_RANGE_START: u64 = 0xFFFF_8000_0000_0000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Size of the direct map window (64 TiB of physical memory).
pub const HHDM_SIZE: u64 = 1 << 46;

/// Per-process hyperspace (temporary mappings, working set lists).
pub const HYPER_SPACE: u64 = 0xFFFF_F700_0000_0000;

/// Last byte of hyperspace.
pub const HYPER_SPACE_END: u64 = 0xFFFF_F77F_FFFF_FFFF;

/// Start of the paged pool.
pub const PAGED_POOL_START: u64 = 0xFFFF_F8A0_0000_0000;

/// Initial paged pool size.
pub const MIN_INIT_PAGED_POOL_SIZE: u64 = 32 * 1024 * 1024;

/// End (exclusive) of session space.
pub const SESSION_SPACE_END: u64 = 0xFFFF_F980_0000_0000;

/// End (exclusive) of the session view region.
pub const SESSION_VIEW_END: u64 = 0xFFFF_F97F_FF00_0000;

pub const SESSION_IMAGE_SIZE: u64 = 16 * 1024 * 1024;
pub const SESSION_VIEW_SIZE: u64 = 104 * 1024 * 1024;
pub const SESSION_POOL_SIZE: u64 = 64 * 1024 * 1024;
pub const SYSTEM_VIEW_SIZE: u64 = 104 * 1024 * 1024;

/// The non-paged system region never starts below this address.
pub const NON_PAGED_SYSTEM_START_MIN: u64 = 0xFFFF_FAA0_0000_0000;

/// End (exclusive) of the non-paged pool; the PFN database sits below it.
pub const NONPAGED_POOL_END: u64 = 0xFFFF_FAE0_0000_0000;

/// Default number of system PTEs reserved below the non-paged pool.
pub const DEFAULT_SYSTEM_PTES: u64 = 22_000;

/// The non-paged system region is aligned down to this boundary.
pub const NON_PAGED_SYSTEM_ALIGNMENT: u64 = 4 * 1024 * 1024;

/// Minimum initial non-paged pool size.
pub const MIN_NONPAGED_POOL_SIZE: u64 = 256 * 1024;

/// Initial non-paged pool growth per MiB of RAM above 4 MiB.
pub const MIN_ADDITION_NONPAGED_POOL_PER_MB: u64 = 32 * 1024;

/// Default maximum non-paged pool size.
pub const DEFAULT_MAXIMUM_NONPAGED_POOL: u64 = 1024 * 1024;

/// Maximum non-paged pool growth per MiB of RAM above 4 MiB.
pub const MAX_ADDITION_NONPAGED_POOL_PER_MB: u64 = 400 * 1024;

/// Upper bound for the initial non-paged pool.
pub const MAX_INIT_NONPAGED_POOL_SIZE: u64 = 128 * 1024 * 1024 * 1024;

/// Upper bound for the maximum non-paged pool.
pub const MAX_NONPAGED_POOL_SIZE: u64 = 128 * 1024 * 1024 * 1024;

/// Machines with at most this many pages get a fixed 2 MiB non-paged pool.
pub const MIN_PAGES_FOR_NONPAGED_POOL_TUNING: u64 = (255 * 1024 * 1024) >> 12;

/// Small-machine non-paged pool size.
pub const SMALL_MACHINE_NONPAGED_POOL: u64 = 2 * 1024 * 1024;

/// Allocation granularity for user virtual memory reservations.
pub const VIRTUAL_MEMORY_GRANULARITY: u64 = 64 * 1024;

/// Where the kernel executes (VMA), matches your linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// The size of a kernel thread stack.
pub const KERNEL_STACK_SIZE: u64 = 32 * 1024;

/// The size of a kernel stack for threads that also run GUI system calls.
pub const KERNEL_LARGE_STACK_SIZE: u64 = 64 * 1024;

const _: () = {
    assert!(KERNEL_STACK_SIZE.is_multiple_of(4096));
    assert!(KERNEL_LARGE_STACK_SIZE.is_multiple_of(4096));
    assert!(HIGHEST_USER_ADDRESS < USER_PROBE_ADDRESS);
    assert!(USER_PROBE_ADDRESS < SYSTEM_RANGE_START);
    assert!(HHDM_BASE >= SYSTEM_RANGE_START);
    assert!(HHDM_BASE + HHDM_SIZE <= HYPER_SPACE);
    assert!(HYPER_SPACE_END < PAGED_POOL_START);
    assert!(SESSION_VIEW_END <= SESSION_SPACE_END - SESSION_IMAGE_SIZE);
    assert!(SESSION_SPACE_END <= NON_PAGED_SYSTEM_START_MIN);
    assert!(NON_PAGED_SYSTEM_START_MIN < NONPAGED_POOL_END);
    assert!(NONPAGED_POOL_END < KERNEL_BASE);
};
