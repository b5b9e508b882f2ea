//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw addresses and page numbers used by the
//! paging and memory-management crates.
//!
//! ## Overview
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory or MMIO space. |
//! | [`VirtualAddress`] | A byte address translated through the page tables. |
//! | [`VirtualPageNumber`] | A virtual address shifted right by [`PAGE_SHIFT`]. |
//!
//! Physical frame numbers are intentionally *not* modeled here: the frame
//! database owns that handle type so that only validated frame numbers ever
//! leave it.
//!
//! The memory manager works with a single base page size of 4 KiB; larger
//! leaves are a property of the page-table layer and never leak into these
//! types.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0000_7FFF_1234_5678);
//! assert_eq!(va.page_offset(), 0x678);
//! assert_eq!(va.page_number().base(), va.page_base());
//!
//! let vpn = VirtualPageNumber::new(100);
//! assert_eq!(vpn.base().as_u64(), 100 * PAGE_SIZE);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod page_number;
mod physical_address;
mod virtual_address;

pub use page_number::VirtualPageNumber;
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// log2 of the base page size.
pub const PAGE_SHIFT: u32 = 12;

/// Base page size in bytes (4 KiB).
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Mask selecting the in-page offset bits.
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Round `value` down to a multiple of `align` (a power of two).
#[inline(always)]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Round `value` up to a multiple of `align` (a power of two).
///
/// Returns `None` on overflow.
#[inline(always)]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Number of base pages needed to hold `bytes` bytes.
#[inline(always)]
#[must_use]
pub const fn bytes_to_pages(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}
