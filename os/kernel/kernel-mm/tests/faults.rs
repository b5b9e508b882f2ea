mod common;

use common::{boot, kernel, private_area, read_u64, touch, user, verify, write_u64};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_mm::area::{AreaFlags, AreaKind};
use kernel_mm::{AccessKind, FaultContext, FaultResolution, MemoryConsumer, MmError, ProcessorMode, Protection};
use kernel_vmem::PageFaultErrorCode;

const BASE: u64 = 0x40_0000;

#[test]
fn demand_zero_then_spurious() {
    let mm = boot(0x1000);
    let space = mm.create_address_space().unwrap();
    let va = private_area(&mm, &space, BASE, 2, Protection::READ_WRITE);

    assert_eq!(touch(&mm, &space, va + 0x123, AccessKind::Read), Ok(FaultResolution::DemandZero));
    assert!(mm.query_present(&space, va));
    assert!(!mm.query_dirty(&space, va));
    assert_eq!(read_u64(&mm, &space, va), 0);
    assert_eq!(touch(&mm, &space, va, AccessKind::Write), Ok(FaultResolution::Spurious));

    assert_eq!(touch(&mm, &space, va.add_pages(1), AccessKind::Write), Ok(FaultResolution::DemandZero));
    assert!(mm.query_dirty(&space, va.add_pages(1)));
    mm.with_frames(|db| assert_eq!(db.consumer_used(MemoryConsumer::User), 2));
    verify(&mm);
}

#[test]
fn access_violations() {
    let mm = boot(0x1000);
    let space = mm.create_address_space().unwrap();
    let ro = private_area(&mm, &space, BASE, 1, Protection::READ_ONLY);
    let rw = private_area(&mm, &space, BASE + 0x1_0000, 1, Protection::READ_WRITE);
    let none = private_area(&mm, &space, BASE + 0x2_0000, 1, Protection::NO_ACCESS);

    let outside = VirtualAddress::new(BASE + 0x10_0000);
    assert_eq!(touch(&mm, &space, outside, AccessKind::Read), Err(MmError::AccessViolation(outside)));
    assert_eq!(touch(&mm, &space, ro, AccessKind::Write), Err(MmError::AccessViolation(ro)));
    assert_eq!(touch(&mm, &space, none, AccessKind::Read), Err(MmError::AccessViolation(none)));

    // present but not executable
    touch(&mm, &space, rw, AccessKind::Write).unwrap();
    assert_eq!(touch(&mm, &space, rw, AccessKind::Execute), Err(MmError::AccessViolation(rw)));

    // user mode never reaches the system range
    let pool = mm.layout().nonpaged_pool.start;
    assert_eq!(
        mm.handle_fault(pool, AccessKind::Read, user(&space)),
        Err(MmError::AccessViolation(pool))
    );
    let bad = VirtualAddress::new(0x0000_8000_0000_0000);
    assert_eq!(touch(&mm, &space, bad, AccessKind::Read), Err(MmError::AccessViolation(bad)));
}

#[test]
fn kernel_faults_resolve_against_the_system_space() {
    let mm = boot(0x1000);
    let space = mm.create_address_space().unwrap();
    let va = mm
        .create_area(
            mm.kernel_space(),
            AreaKind::VirtualMemory,
            None,
            PAGE_SIZE,
            Protection::READ_WRITE,
            AreaFlags::new(),
        )
        .unwrap();

    // faulting from a process context still lands in the kernel tables
    assert_eq!(mm.handle_fault(va, AccessKind::Write, kernel(&space)), Ok(FaultResolution::DemandZero));
    assert!(mm.query_present(mm.kernel_space(), va));
    assert!(mm.query_present(&space, va));
    mm.with_frames(|db| assert_eq!(db.consumer_used(MemoryConsumer::User), 0));
}

#[test]
fn private_write_copy_page_flips_in_place() {
    let mm = boot(0x1000);
    let space = mm.create_address_space().unwrap();
    let va = private_area(&mm, &space, BASE, 1, Protection::WRITE_COPY);

    assert_eq!(touch(&mm, &space, va, AccessKind::Read), Ok(FaultResolution::DemandZero));
    assert_eq!(mm.get_protection(&space, va), Some(Protection::WRITE_COPY));
    let used = mm.frame_counts().active;
    assert_eq!(touch(&mm, &space, va, AccessKind::Write), Ok(FaultResolution::CopyOnWrite));
    assert_eq!(mm.get_protection(&space, va), Some(Protection::READ_WRITE));
    assert_eq!(mm.frame_counts().active, used);
}

#[test]
fn shared_write_copy_page_is_copied() {
    let mm = boot(0x1000);
    let p1 = mm.create_address_space().unwrap();
    let p2 = mm.create_address_space().unwrap();
    let va = VirtualAddress::new(BASE);
    for space in [&p1, &p2] {
        mm.create_area(space, AreaKind::SectionView, Some(va), PAGE_SIZE, Protection::WRITE_COPY, AreaFlags::new())
            .unwrap();
    }

    let shared = mm.allocate_zeroed(MemoryConsumer::Cache).unwrap();
    (unsafe { mm.frame_contents(shared) })[..8].copy_from_slice(&7u64.to_le_bytes());
    mm.create_mapping(&p1, va, Protection::WRITE_COPY, &[shared]).unwrap();
    mm.create_mapping(&p2, va, Protection::WRITE_COPY, &[shared]).unwrap();
    assert_eq!(read_u64(&mm, &p1, va), 7);

    write_u64(&mm, &p1, va, 8);
    assert_eq!(read_u64(&mm, &p1, va), 8);
    assert_eq!(read_u64(&mm, &p2, va), 7);
    assert_eq!(mm.get_protection(&p1, va), Some(Protection::READ_WRITE));
    assert_eq!(mm.get_protection(&p2, va), Some(Protection::WRITE_COPY));

    assert_eq!(mm.mappers(shared).len(), 1);
    assert_eq!(mm.get_reference_count(shared), 2);
    mm.delete_mapping(&p2, va).unwrap();
    mm.free(shared);
    verify(&mm);
}

#[test]
fn copies_span_page_boundaries() {
    let mm = boot(0x1000);
    let space = mm.create_address_space().unwrap();
    let va = private_area(&mm, &space, BASE, 3, Protection::READ_WRITE);
    let data: Vec<u8> = (0..=255).cycle().take(2 * PAGE_SIZE as usize).collect();
    let at = va + (PAGE_SIZE - 100);

    mm.copy_to_space(&space, at, &data).unwrap();
    let mut back = vec![0; data.len()];
    mm.copy_from_space(&space, at, &mut back).unwrap();
    assert_eq!(back, data);
    for page in 0..3 {
        assert!(mm.query_dirty(&space, va.add_pages(page)));
    }

    let mut beyond = [0; 16];
    assert_eq!(
        mm.copy_from_space(&space, va.add_pages(3), &mut beyond),
        Err(MmError::AccessViolation(va.add_pages(3)))
    );
}

#[test]
fn error_code_decoding() {
    let write_user = PageFaultErrorCode::new().with_write(true).with_user(true);
    assert_eq!(FaultContext::decode(write_user), (AccessKind::Write, ProcessorMode::User));
    let fetch = PageFaultErrorCode::new().with_instruction_fetch(true).with_present(true);
    assert_eq!(FaultContext::decode(fetch), (AccessKind::Execute, ProcessorMode::Kernel));
    assert_eq!(
        FaultContext::decode(PageFaultErrorCode::new()),
        (AccessKind::Read, ProcessorMode::Kernel)
    );
}

#[test]
fn faults_in_a_deleted_space_fail() {
    let mm = boot(0x1000);
    let space = mm.create_address_space().unwrap();
    let va = private_area(&mm, &space, BASE, 1, Protection::READ_WRITE);
    mm.delete_address_space(&space).unwrap();
    assert_eq!(touch(&mm, &space, va, AccessKind::Read), Err(MmError::AccessViolation(va)));
}
