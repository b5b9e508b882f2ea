mod common;

use common::{boot, verify};
use kernel_memory_addresses::VirtualAddress;
use kernel_mm::{MemoryConsumer, Protection};

#[test]
fn shared_frame_is_visited_once_per_mapping() {
    let mm = boot(0x1000);
    let p1 = mm.create_address_space().unwrap();
    let p2 = mm.create_address_space().unwrap();
    let va1 = VirtualAddress::new(0x10_0000);
    let va2 = VirtualAddress::new(0x20_0000);
    let pfn = mm.allocate(MemoryConsumer::User).unwrap();

    mm.create_mapping(&p1, va1, Protection::READ_WRITE, &[pfn]).unwrap();
    mm.create_mapping(&p2, va2, Protection::READ_ONLY, &[pfn]).unwrap();
    assert_eq!(mm.get_reference_count(pfn), 3);
    mm.with_frames(|db| assert_eq!(db.entry(pfn).share_count(), 2));

    let mut visits = Vec::new();
    let visited = mm.delete_all(pfn, |space, va| visits.push((space.id(), va)));
    assert_eq!(visited, 2);
    visits.sort();
    let mut expected = vec![(p1.id(), va1), (p2.id(), va2)];
    expected.sort();
    assert_eq!(visits, expected);

    assert_eq!(mm.unmap_all(pfn), 2);
    assert!(!mm.query_present(&p1, va1));
    assert!(!mm.query_present(&p2, va2));
    assert!(mm.mappers(pfn).is_empty());
    assert_eq!(mm.get_reference_count(pfn), 1);

    mm.free(pfn);
    assert_eq!(mm.get_reference_count(pfn), 0);
    assert!(mm.mappers(pfn).is_empty());
    verify(&mm);
}

#[test]
fn dirty_state_across_mappings() {
    let mm = boot(0x1000);
    let p1 = mm.create_address_space().unwrap();
    let p2 = mm.create_address_space().unwrap();
    let va = VirtualAddress::new(0x10_0000);
    let pfn = mm.allocate(MemoryConsumer::User).unwrap();
    mm.create_mapping(&p1, va, Protection::READ_WRITE, &[pfn]).unwrap();
    mm.create_mapping(&p2, va, Protection::READ_WRITE, &[pfn]).unwrap();

    assert!(!mm.is_dirty_any(pfn));
    mm.set_dirty(&p2, va);
    assert!(mm.is_dirty_any(pfn));

    assert_eq!(mm.set_dirty_all(pfn), 1);
    assert!(mm.query_dirty(&p1, va));

    assert_eq!(mm.set_clean_all(pfn), 2);
    assert!(!mm.is_dirty_any(pfn));
    // already clean: nothing changes the second time
    assert_eq!(mm.set_clean_all(pfn), 0);
    assert!(!mm.query_dirty(&p1, va));
    assert!(!mm.query_dirty(&p2, va));

    assert_eq!(mm.unmap_all(pfn), 2);
    mm.free(pfn);
    verify(&mm);
}

#[test]
fn manual_rmap_entries() {
    let mm = boot(0x1000);
    let pfn = mm.allocate(MemoryConsumer::Cache).unwrap();
    let space = mm.kernel_space().id();
    let va = VirtualAddress::new(0xFFFF_F8A0_0000_0000);

    mm.rmap_insert(pfn, space, va);
    assert_eq!(mm.mappers(pfn).len(), 1);
    assert!(mm.rmap_delete(pfn, space, va));
    assert!(!mm.rmap_delete(pfn, space, va));
    assert!(mm.mappers(pfn).is_empty());
    mm.free(pfn);
}

#[test]
fn mappers_of_deleted_spaces_are_skipped() {
    let mm = boot(0x1000);
    let p1 = mm.create_address_space().unwrap();
    let pfn = mm.allocate(MemoryConsumer::User).unwrap();
    let va = VirtualAddress::new(0x10_0000);

    // recorded by hand for a space that then goes away
    mm.rmap_insert(pfn, p1.id(), va);
    mm.delete_address_space(&p1).unwrap();
    assert_eq!(mm.delete_all(pfn, |_, _| panic!("dead space visited")), 0);
    assert!(mm.rmap_delete(pfn, p1.id(), va));
    mm.free(pfn);
}
