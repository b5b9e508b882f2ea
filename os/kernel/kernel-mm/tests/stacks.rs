mod common;

use common::{boot, kernel, verify};
use kernel_info::memory::{KERNEL_LARGE_STACK_SIZE, KERNEL_STACK_SIZE};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_mm::area::AreaKind;
use kernel_mm::{AccessKind, FaultResolution, MemoryConsumer, MmError};

fn below(top: VirtualAddress, bytes: u64) -> VirtualAddress {
    VirtualAddress::new(top.as_u64() - bytes)
}

#[test]
fn stack_pages_are_resident_below_the_top() {
    let mm = boot(0x1000);
    let top = mm.create_kernel_stack(false).unwrap();
    let kernel_space = mm.kernel_space();
    assert!(mm.layout().system_ptes.contains(below(top, PAGE_SIZE)));

    for page in 1..=KERNEL_STACK_SIZE / PAGE_SIZE {
        assert!(mm.query_present(kernel_space, below(top, page * PAGE_SIZE)));
    }
    let area = mm.find_area_by_address(kernel_space, below(top, PAGE_SIZE)).unwrap();
    assert_eq!(area.kind(), AreaKind::KernelStack);
    assert!(area.flags().locked());

    // already resident, nothing to resolve
    assert_eq!(
        mm.handle_fault(below(top, 8), AccessKind::Write, kernel(kernel_space)),
        Ok(FaultResolution::Spurious)
    );
    mm.delete_kernel_stack(top, false).unwrap();
}

#[test]
fn overflow_hits_the_guard_page() {
    let mm = boot(0x1000);
    let top = mm.create_kernel_stack(false).unwrap();
    let guard = below(top, KERNEL_STACK_SIZE + PAGE_SIZE);
    assert!(!mm.query_present(mm.kernel_space(), guard));
    assert_eq!(
        mm.handle_fault(guard + 0xFF8, AccessKind::Write, kernel(mm.kernel_space())),
        Err(MmError::AccessViolation(guard + 0xFF8))
    );
    mm.delete_kernel_stack(top, false).unwrap();
}

#[test]
fn deleting_returns_the_frames() {
    let mm = boot(0x1000);
    // the first stack may pull in page tables that stay around
    let warm_up = mm.create_kernel_stack(false).unwrap();
    mm.delete_kernel_stack(warm_up, false).unwrap();
    let system = mm.with_frames(|db| db.consumer_used(MemoryConsumer::System));
    let available = mm.frame_counts().available();

    let top = mm.create_kernel_stack(false).unwrap();
    let pages = (KERNEL_STACK_SIZE / PAGE_SIZE) as usize;
    mm.with_frames(|db| assert_eq!(db.consumer_used(MemoryConsumer::System), system + pages));
    mm.delete_kernel_stack(top, false).unwrap();
    mm.with_frames(|db| assert_eq!(db.consumer_used(MemoryConsumer::System), system));
    assert_eq!(mm.frame_counts().available(), available);
    assert!(!mm.query_present(mm.kernel_space(), below(top, PAGE_SIZE)));

    assert_eq!(mm.delete_kernel_stack(top, false), Err(MmError::InvalidAddress(top)));
    verify(&mm);
}

#[test]
fn large_stacks_are_told_apart() {
    let mm = boot(0x1000);
    let small = mm.create_kernel_stack(false).unwrap();
    let large = mm.create_kernel_stack(true).unwrap();
    assert_ne!(small, large);
    for page in 1..=KERNEL_LARGE_STACK_SIZE / PAGE_SIZE {
        assert!(mm.query_present(mm.kernel_space(), below(large, page * PAGE_SIZE)));
    }

    // the size has to match
    assert_eq!(mm.delete_kernel_stack(large, false), Err(MmError::InvalidAddress(large)));
    assert_eq!(mm.delete_kernel_stack(small, true), Err(MmError::InvalidAddress(small)));
    mm.delete_kernel_stack(large, true).unwrap();
    mm.delete_kernel_stack(small, false).unwrap();

    // not a stack at all
    let pool = mm.layout().nonpaged_pool.start;
    assert_eq!(mm.delete_kernel_stack(pool, false), Err(MmError::InvalidAddress(pool)));
    verify(&mm);
}
