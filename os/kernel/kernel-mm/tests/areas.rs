mod common;

use common::{boot, private_area, touch, verify};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_mm::area::{AreaFlags, AreaKind, PageDisposition, RegionState};
use kernel_mm::{AccessKind, FaultResolution, MemoryConsumer, MmError, Protection};
use std::sync::Arc;

#[test]
fn find_area_inside_a_ten_page_area() {
    let mm = boot(0x1000);
    let space = mm.create_address_space().unwrap();
    let start = private_area(&mm, &space, 100 * PAGE_SIZE, 10, Protection::READ_WRITE);
    assert_eq!(start.as_u64(), 100 * PAGE_SIZE);

    let area = mm.find_area_by_address(&space, VirtualAddress::new(105 * PAGE_SIZE)).unwrap();
    assert_eq!(area.start(), start);
    assert_eq!(area.pages(), 10);
    assert_eq!(area.kind(), AreaKind::VirtualMemory);
    assert!(mm.find_area_by_address(&space, VirtualAddress::new(110 * PAGE_SIZE)).is_none());
    assert!(mm.find_area_by_address(&space, VirtualAddress::new(99 * PAGE_SIZE)).is_none());

    assert!(mm.find_area_by_range(&space, VirtualAddress::new(95 * PAGE_SIZE), 6 * PAGE_SIZE).is_some());
    assert!(mm.find_area_by_range(&space, VirtualAddress::new(90 * PAGE_SIZE), 10 * PAGE_SIZE).is_none());
}

#[test]
fn discarding_an_area_releases_its_frames() {
    let mm = boot(0x1000);
    let space = mm.create_address_space().unwrap();
    let start = private_area(&mm, &space, 100 * PAGE_SIZE, 10, Protection::READ_WRITE);
    for page in 0..10 {
        assert_eq!(touch(&mm, &space, start.add_pages(page), AccessKind::Write), Ok(FaultResolution::DemandZero));
    }
    mm.with_frames(|db| assert_eq!(db.consumer_used(MemoryConsumer::User), 10));
    let available = mm.frame_counts().available();

    let mut seen = 0;
    let freed = mm
        .free_area(&space, start, |page| {
            assert!(page.frame.is_some());
            assert!(page.dirty);
            seen += 1;
            PageDisposition::Discard
        })
        .unwrap();
    assert_eq!(seen, 10);
    assert_eq!(freed.released, 10);
    assert!(freed.swapped.is_empty());
    assert_eq!(mm.frame_counts().available(), available + 10);
    mm.with_frames(|db| assert_eq!(db.consumer_used(MemoryConsumer::User), 0));

    assert!(mm.find_area_by_address(&space, start.add_pages(5)).is_none());
    assert!(!mm.query_present(&space, start));
    assert_eq!(mm.free_area(&space, start, |_| PageDisposition::Discard), Err(MmError::InvalidAddress(start)));
    verify(&mm);
}

#[test]
fn swapping_an_area_hands_slots_to_the_caller() {
    let mm = boot(0x1000);
    let file = Arc::new(common::MemoryPageFile::default());
    mm.register_paging_file(256, file.clone()).unwrap();
    let space = mm.create_address_space().unwrap();
    let start = private_area(&mm, &space, 0x40_0000, 4, Protection::READ_WRITE);
    for page in 0..4 {
        common::write_u64(&mm, &space, start.add_pages(page), 0x1000 + page);
    }

    let freed = mm.free_area(&space, start, |_| PageDisposition::Swap).unwrap();
    assert_eq!(freed.released, 4);
    assert_eq!(freed.swapped.len(), 4);
    assert_eq!(mm.frame_counts().modified, 4);
    assert_eq!(mm.swap_usage().0, 4);

    assert_eq!(mm.write_modified_pages(16), 4);
    assert_eq!(mm.frame_counts().modified, 0);
    for (page, (va, slot)) in freed.swapped.iter().enumerate() {
        assert_eq!(*va, start.add_pages(page as u64));
        let stored = file.contents(*slot).unwrap();
        let value = u64::from_le_bytes(stored[..8].try_into().unwrap());
        assert_eq!(value, 0x1000 + page as u64);
        mm.free_swap_slot(*slot).unwrap();
    }
    assert_eq!(mm.swap_usage().0, 0);
    verify(&mm);
}

#[test]
fn write_back_without_backing_store_discards() {
    let mm = boot(0x1000);
    let space = mm.create_address_space().unwrap();
    let start = private_area(&mm, &space, 0x40_0000, 2, Protection::READ_WRITE);
    touch(&mm, &space, start, AccessKind::Write).unwrap();

    let freed = mm.free_area(&space, start, |_| PageDisposition::WriteBack).unwrap();
    assert_eq!(freed.released, 1);
    assert_eq!(mm.frame_counts().modified, 0);
    verify(&mm);
}

#[test]
fn placement_honours_hints_and_granularity() {
    let mm = boot(0x1000);
    let space = mm.create_address_space().unwrap();

    let first = mm
        .create_area(&space, AreaKind::VirtualMemory, None, 3 * PAGE_SIZE, Protection::READ_WRITE, AreaFlags::new())
        .unwrap();
    assert_eq!(first.as_u64() % 0x1_0000, 0);
    let second = mm
        .create_area(&space, AreaKind::VirtualMemory, None, PAGE_SIZE, Protection::READ_ONLY, AreaFlags::new())
        .unwrap();
    assert_eq!(second.as_u64() % 0x1_0000, 0);
    assert!(second.as_u64() >= first.as_u64() + 3 * PAGE_SIZE);

    let top = mm
        .create_area(
            &space,
            AreaKind::VirtualMemory,
            None,
            PAGE_SIZE,
            Protection::READ_ONLY,
            AreaFlags::new().with_top_down(true),
        )
        .unwrap();
    assert!(top.as_u64() > 0x7F0_0000_0000);

    let hinted = VirtualAddress::new(0x200_0000);
    private_area(&mm, &space, hinted.as_u64(), 8, Protection::READ_WRITE);
    assert_eq!(
        mm.create_area(&space, AreaKind::VirtualMemory, Some(hinted.add_pages(4)), PAGE_SIZE, Protection::READ_WRITE, AreaFlags::new()),
        Err(MmError::AreaConflict(hinted.add_pages(4)))
    );
    assert_eq!(
        mm.create_area(&space, AreaKind::VirtualMemory, None, 0, Protection::READ_WRITE, AreaFlags::new()),
        Err(MmError::InvalidLength(0))
    );
    let kernel_address = VirtualAddress::new(0xFFFF_8000_0000_0000);
    assert_eq!(
        mm.create_area(&space, AreaKind::VirtualMemory, Some(kernel_address), PAGE_SIZE, Protection::READ_WRITE, AreaFlags::new()),
        Err(MmError::InvalidAddress(kernel_address))
    );

    let gap = mm.find_gap(&space, 16 * PAGE_SIZE, 0x1_0000, false).unwrap();
    assert_eq!(gap.as_u64() % 0x1_0000, 0);
    assert!(mm.find_area_by_range(&space, gap, 16 * PAGE_SIZE).is_none());
}

#[test]
fn kernel_areas_go_to_the_system_pte_region() {
    let mm = boot(0x1000);
    let kernel = mm.kernel_space();
    let va = mm
        .create_area(kernel, AreaKind::VirtualMemory, None, 4 * PAGE_SIZE, Protection::READ_WRITE, AreaFlags::new())
        .unwrap();
    let region = mm.layout().system_ptes;
    assert!(region.contains(va));

    // boot-time regions cannot be released
    let pool = mm.layout().nonpaged_pool.start;
    assert!(mm.find_area_by_address(kernel, pool).unwrap().flags().is_static());
    assert_eq!(
        mm.free_area(kernel, mm.layout().pfn_database.start, |_| PageDisposition::Discard),
        Err(MmError::InvalidAddress(mm.layout().pfn_database.start))
    );
    mm.free_area(kernel, va, |_| PageDisposition::Discard).unwrap();
}

#[test]
fn altering_regions_decommits_and_reprotects() {
    let mm = boot(0x1000);
    let space = mm.create_address_space().unwrap();
    let start = private_area(&mm, &space, 0x40_0000, 4, Protection::READ_WRITE);
    for page in 0..4 {
        touch(&mm, &space, start.add_pages(page), AccessKind::Write).unwrap();
    }

    mm.alter_region(&space, start.add_pages(1), 2 * PAGE_SIZE, RegionState::Reserved, Protection::NO_ACCESS)
        .unwrap();
    assert!(mm.query_present(&space, start));
    assert!(!mm.query_present(&space, start.add_pages(1)));
    assert!(!mm.query_present(&space, start.add_pages(2)));
    assert!(mm.query_present(&space, start.add_pages(3)));
    assert_eq!(
        touch(&mm, &space, start.add_pages(1), AccessKind::Read),
        Err(MmError::AccessViolation(start.add_pages(1)))
    );

    mm.alter_region(&space, start.add_pages(1), PAGE_SIZE, RegionState::Committed, Protection::READ_ONLY)
        .unwrap();
    assert_eq!(touch(&mm, &space, start.add_pages(1), AccessKind::Read), Ok(FaultResolution::DemandZero));
    assert_eq!(
        touch(&mm, &space, start.add_pages(1), AccessKind::Write),
        Err(MmError::AccessViolation(start.add_pages(1)))
    );

    mm.alter_region(&space, start, PAGE_SIZE, RegionState::Committed, Protection::READ_ONLY)
        .unwrap();
    assert_eq!(mm.get_protection(&space, start), Some(Protection::READ_ONLY));
    assert!(mm.query_dirty(&space, start));

    assert_eq!(
        mm.alter_region(&space, start.add_pages(3), 2 * PAGE_SIZE, RegionState::Reserved, Protection::NO_ACCESS),
        Err(MmError::InvalidAddress(start.add_pages(3)))
    );
    verify(&mm);
}
