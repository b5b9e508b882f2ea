//! # Virtual Memory Support
//!
//! x86-64 paging structures and the table walker the memory manager builds on.
//!
//! ## What you get
//! - [`PageTableEntry`], a bitfield view of one 64-bit entry including the
//!   software-defined bits used for swap locators, copy-on-write and
//!   "disabled" (no-access) mappings.
//! - A 4 KiB-aligned [`PageTable`] and the [`TableLevel`] index helpers.
//! - [`PageTableWalker`], which walks a hierarchy top-down and allocates
//!   missing intermediate tables lazily.
//! - The two seams that keep this crate free of policy: [`FrameAlloc`] hands
//!   out frames for new tables, [`PhysMapper`] makes a physical frame
//!   addressable.
//! - [`PageFaultErrorCode`], the decoded `#PF` error code.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! Each level holds 512 entries of 8 bytes. A present non-leaf entry points
//! at the next table; the PT entry maps one 4 KiB page. Large leaves (PS=1)
//! are recognized when walking but never created by the memory manager.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

#[cfg(any(test, feature = "sim"))]
extern crate alloc;

mod fault_code;
mod page_entry;
mod page_table;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
mod walker;

pub use crate::fault_code::PageFaultErrorCode;
pub use crate::page_entry::{MAX_SWAP_LOCATOR, PageTableEntry, PteState};
pub use crate::page_table::{ENTRIES_PER_TABLE, PageTable, TableLevel};
pub use crate::walker::{PageTableWalker, WalkError};

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

/// Source of physical 4 KiB frames for new page tables.
///
/// Returned frames must be page aligned; the walker zeroes them before
/// linking them into the hierarchy. Returns `None` on out-of-memory.
pub trait FrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress>;
}

/// Converts physical addresses to *temporarily* usable pointers in the current
/// virtual address space (e.g., via a higher-half direct map).
///
/// # Safety
/// Implementations must return a pointer through which the whole `T` at `pa`
/// is readable and writable for `'a`. Callers must not create overlapping
/// mutable references through it.
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// `pa` must refer to memory that holds a valid `T` (any bit pattern is
    /// valid for the page-table and byte-array types used here) and no other
    /// live reference may alias it.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// Invalidate the TLB entry for one page on the current CPU.
///
/// On hosted builds there is no TLB to flush and this does nothing.
#[inline]
pub fn invalidate_tlb_page(va: VirtualAddress) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = va;
}

/// Size of one page-table frame.
pub const TABLE_SIZE: u64 = kernel_memory_addresses::PAGE_SIZE;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedRam;

    /// Hands out frames from a fixed range.
    struct BumpAlloc {
        next: u64,
        end: u64,
    }

    impl FrameAlloc for BumpAlloc {
        fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
            if self.next >= self.end {
                return None;
            }
            let pa = PhysicalAddress::from_frame_number(self.next);
            self.next += 1;
            Some(pa)
        }
    }

    fn root() -> PhysicalAddress {
        PhysicalAddress::from_frame_number(1)
    }

    #[test]
    fn ensure_leaf_allocates_three_tables_once() {
        let ram = SimulatedRam::new();
        let mut alloc = BumpAlloc { next: 2, end: 64 };
        let mut walker = PageTableWalker::new(&ram, root());

        let va = VirtualAddress::new(0x0000_0000_4020_1000);
        {
            let pte = walker.ensure_leaf(va, &mut alloc).unwrap();
            assert_eq!(pte.state(), PteState::Empty);
            *pte = PageTableEntry::new_leaf(PhysicalAddress::from_frame_number(0x500))
                .with_writable(true);
        }
        assert_eq!(alloc.next, 5, "PDPT, PD and PT");

        // Neighbour in the same PT needs nothing new.
        let _ = walker.ensure_leaf(va.add_pages(1), &mut alloc).unwrap();
        assert_eq!(alloc.next, 5);

        assert_eq!(
            walker.translate(va + 0x123),
            Some(PhysicalAddress::from_frame_number(0x500) + 0x123)
        );
        assert_eq!(walker.translate(va.add_pages(1)), None);
    }

    #[test]
    fn lookup_without_tables_is_none() {
        let ram = SimulatedRam::new();
        let mut walker = PageTableWalker::new(&ram, root());
        assert!(walker.leaf(VirtualAddress::new(0x1000)).is_none());
        assert!(
            walker
                .entry(VirtualAddress::new(0x1000), TableLevel::Pml4)
                .is_some()
        );
    }

    #[test]
    fn exhausted_allocator_reports_level() {
        let ram = SimulatedRam::new();
        let mut alloc = BumpAlloc { next: 2, end: 4 };
        let mut walker = PageTableWalker::new(&ram, root());
        let err = walker
            .ensure_leaf(VirtualAddress::new(0x20_0000), &mut alloc)
            .unwrap_err();
        assert_eq!(err, WalkError::OutOfMemory(TableLevel::Pt));
    }

    #[test]
    fn user_tables_are_user_accessible() {
        let ram = SimulatedRam::new();
        let mut alloc = BumpAlloc { next: 2, end: 16 };
        let mut walker = PageTableWalker::new(&ram, root());
        let user = VirtualAddress::new(0x0000_0010_0000_0000);
        let kernel = VirtualAddress::new(0xFFFF_F8A0_0000_0000);
        let _ = walker.ensure_leaf(user, &mut alloc).unwrap();
        let _ = walker.ensure_leaf(kernel, &mut alloc).unwrap();

        assert!(walker.entry(user, TableLevel::Pml4).unwrap().user_access());
        assert!(walker.entry(user, TableLevel::Pd).unwrap().user_access());
        assert!(!walker.entry(kernel, TableLevel::Pml4).unwrap().user_access());
    }

    #[test]
    fn freeing_user_tables_keeps_kernel_half() {
        let ram = SimulatedRam::new();
        let mut alloc = BumpAlloc { next: 2, end: 32 };
        let mut walker = PageTableWalker::new(&ram, root());
        let _ = walker
            .ensure_leaf(VirtualAddress::new(0x1000), &mut alloc)
            .unwrap();
        let _ = walker
            .ensure_leaf(VirtualAddress::new(0x0000_0100_0000_0000), &mut alloc)
            .unwrap();
        let kernel = VirtualAddress::new(0xFFFF_FAE0_0000_0000 - 0x1000);
        let _ = walker.ensure_leaf(kernel, &mut alloc).unwrap();

        let mut freed = alloc::vec::Vec::new();
        walker.free_user_tables(|pa| freed.push(pa));
        assert_eq!(freed.len(), 6);
        assert!(walker.leaf(VirtualAddress::new(0x1000)).is_none());
        assert!(walker.leaf(kernel).is_some());
    }

    #[test]
    fn ensure_entry_stops_at_requested_level() {
        let ram = SimulatedRam::new();
        let mut alloc = BumpAlloc { next: 2, end: 16 };
        let mut walker = PageTableWalker::new(&ram, root());
        let va = VirtualAddress::new(0xFFFF_F8A0_0000_0000);
        let pdpte = walker.ensure_entry(va, TableLevel::Pdpt, &mut alloc).unwrap();
        assert!(pdpte.is_empty());
        assert_eq!(alloc.next, 3, "only the PDPT");
        assert!(walker.entry(va, TableLevel::Pml4).unwrap().present());

        walker.clear_user_half();
        assert!(walker.entry(va, TableLevel::Pml4).unwrap().present());
    }

    #[test]
    fn kernel_half_is_shared_by_copy() {
        let ram = SimulatedRam::new();
        let mut alloc = BumpAlloc { next: 3, end: 32 };
        let system = root();
        let kernel = VirtualAddress::new(0xFFFF_F8A0_0000_0000);
        {
            let mut walker = PageTableWalker::new(&ram, system);
            let pte = walker.ensure_leaf(kernel, &mut alloc).unwrap();
            *pte = PageTableEntry::new_leaf(PhysicalAddress::from_frame_number(0x77));
        }

        let mut process = PageTableWalker::new(&ram, PhysicalAddress::from_frame_number(2));
        process.copy_kernel_half(system);
        assert_eq!(
            process.translate(kernel),
            Some(PhysicalAddress::from_frame_number(0x77))
        );
    }
}
