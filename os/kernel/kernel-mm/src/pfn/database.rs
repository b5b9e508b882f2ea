use super::transition::{SlotTable, TransitionIndex};
use super::{PageList, PageLocation, PageUsage, Pfn, PfnEntry, PfnFlags, PfnStorage, PteLocation};
use crate::balancer::MemoryConsumer;
use crate::error::{BugCheckCode, bug_check};
use crate::rmap::{Mapper, RmapArena, RmapNode};
use crate::space::AddressSpaceId;
use crate::swap::SwapEntry;
use alloc::vec::Vec;
use core::ops::Range;
use kernel_memory_addresses::VirtualAddress;
use log::trace;

/// A frame handed out by [`PfnDatabase::take_page`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TakenPage {
    pub pfn: Pfn,
    /// Came off the zeroed list; no need to clear it again.
    pub zeroed: bool,
}

/// Totals per location.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct FrameCounts {
    pub zeroed: usize,
    pub free: usize,
    pub standby: usize,
    pub modified: usize,
    pub modified_no_write: usize,
    pub bad: usize,
    pub active: usize,
    /// Frames with an entry in the database.
    pub tracked: usize,
}

impl FrameCounts {
    /// Frames an allocation can be satisfied from without I/O.
    #[must_use]
    pub const fn available(&self) -> usize {
        self.zeroed + self.free + self.standby
    }

    #[must_use]
    pub const fn listed(&self) -> usize {
        self.zeroed + self.free + self.standby + self.modified + self.modified_no_write + self.bad
    }
}

/// Outcome of looking up a swap entry in the transition index.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transition {
    /// No frame holds the contents; read them from the paging file.
    Absent,
    /// The frame is under I/O; retry once it completes.
    Busy(Pfn),
    /// The frame was taken off its list and is now active.
    Claimed(Pfn),
}

/// The frame database proper. All methods expect the caller to hold the
/// frame lock, which is what `&mut self` stands for.
pub struct PfnDatabase {
    storage: PfnStorage,
    ranges: Vec<Range<u64>>,
    lists: [PageList; 6],
    user_lru: PageList,
    active: usize,
    tracked: usize,
    used: [usize; MemoryConsumer::COUNT],
    rmap: RmapArena,
    transition: TransitionIndex,
}

impl PfnDatabase {
    #[must_use]
    pub const fn new(storage: PfnStorage) -> Self {
        Self {
            storage,
            ranges: Vec::new(),
            lists: [const { PageList::new() }; 6],
            user_lru: PageList::new(),
            active: 0,
            tracked: 0,
            used: [0; MemoryConsumer::COUNT],
            rmap: RmapArena::new(),
            transition: TransitionIndex::new(),
        }
    }

    /// Create entries for `count` frames starting at `base`.
    ///
    /// List locations queue the frames without per-insert checks; call
    /// [`finish_init`](Self::finish_init) afterwards. Active frames start
    /// with one reference charged to the system consumer.
    pub fn add_range(&mut self, base: u64, count: u64, location: PageLocation, usage: PageUsage) {
        if count == 0 {
            return;
        }
        let end = base + count;
        if end as usize > self.storage.len() || self.ranges.iter().any(|r| r.start < end && base < r.end) {
            bug_check(BugCheckCode::MemoryManagementInvalid, [base, count, end, 0]);
        }
        let at = self.ranges.partition_point(|r| r.start < base);
        self.ranges.insert(at, base..end);

        for number in base..end {
            let pfn = Pfn::new(number);
            let mut entry = PfnEntry::new(location, usage);
            #[allow(clippy::cast_possible_truncation)]
            entry.flags.set_page_color((number & 0xF) as u8);
            if location == PageLocation::Active {
                entry.reference_count = 1;
                entry.consumer = Some(MemoryConsumer::System);
            }
            self.storage.write(pfn, entry);
            match location.list_index() {
                Some(list) => self.lists[list].push_back_unchecked(&mut self.storage, pfn),
                None => {
                    self.active += 1;
                    self.used[MemoryConsumer::System.index()] += 1;
                }
            }
        }
        #[allow(clippy::cast_possible_truncation)]
        let added = count as usize;
        self.tracked += added;
        trace!("PFN {base:#x}..{end:#x} -> {location:?}");
    }

    /// Verify every list once after bulk initialization.
    pub fn finish_init(&self) {
        self.verify();
    }

    /// Validate a frame number.
    #[must_use]
    pub fn pfn(&self, number: u64) -> Option<Pfn> {
        let at = self.ranges.partition_point(|r| r.end <= number);
        self.ranges
            .get(at)
            .filter(|r| r.contains(&number))
            .map(|_| Pfn::new(number))
    }

    /// Validate a frame number; fatal if it has no entry.
    #[must_use]
    pub fn pfn_checked(&self, number: u64) -> Pfn {
        self.pfn(number).unwrap_or_else(|| {
            bug_check(
                BugCheckCode::FrameOutOfRange,
                [number, self.storage.len() as u64, 0, 0],
            )
        })
    }

    /// Managed ranges in ascending order.
    #[must_use]
    pub fn ranges(&self) -> &[Range<u64>] {
        &self.ranges
    }

    #[must_use]
    pub fn entry(&self, pfn: Pfn) -> &PfnEntry {
        let pfn = self.pfn_checked(pfn.number());
        // SAFETY: `pfn_checked` only accepts frames initialized by `add_range`.
        unsafe { self.storage.get(pfn) }
    }

    fn entry_mut(&mut self, pfn: Pfn) -> &mut PfnEntry {
        let pfn = self.pfn_checked(pfn.number());
        // SAFETY: as in `entry`.
        unsafe { self.storage.get_mut(pfn) }
    }

    fn list(&self, location: PageLocation) -> &PageList {
        match location.list_index() {
            Some(index) => &self.lists[index],
            None => bug_check(BugCheckCode::MemoryManagementInvalid, [0, 0, 0, 1]),
        }
    }

    #[must_use]
    pub fn counts(&self) -> FrameCounts {
        FrameCounts {
            zeroed: self.lists[0].total(),
            free: self.lists[1].total(),
            standby: self.lists[2].total(),
            modified: self.lists[3].total(),
            modified_no_write: self.lists[4].total(),
            bad: self.lists[5].total(),
            active: self.active,
            tracked: self.tracked,
        }
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.counts().available()
    }

    #[must_use]
    pub const fn consumer_used(&self, consumer: MemoryConsumer) -> usize {
        self.used[consumer.index()]
    }

    /// Oldest frame on a list.
    #[must_use]
    pub fn first(&self, location: PageLocation) -> Option<Pfn> {
        self.list(location).head()
    }

    /// The frame after `pfn` on `location`'s list, if `pfn` is listed there.
    #[must_use]
    pub fn next_listed(&self, location: PageLocation, pfn: Pfn) -> Option<Pfn> {
        let entry = self.entry(pfn);
        if entry.location != location {
            return None;
        }
        let next = entry.flink?;
        (Some(next) != self.list(location).head()).then_some(next)
    }

    /// Take a frame off `location`'s list. It becomes active with no
    /// references ("in transit") until it is claimed or inserted elsewhere.
    pub fn remove(&mut self, location: PageLocation, pfn: Pfn) {
        let current = self.entry(pfn).location;
        let Some(index) = location.list_index().filter(|_| current == location) else {
            bug_check(
                BugCheckCode::PfnListCorrupt,
                [pfn.number(), location as u64, current as u64, 0],
            );
        };
        self.lists[index].remove(&mut self.storage, pfn);
        self.entry_mut(pfn).location = PageLocation::Active;
        self.active += 1;
    }

    /// Put an in-transit frame (active, zero references) onto a list.
    pub fn insert(&mut self, location: PageLocation, pfn: Pfn) {
        let entry = self.entry(pfn);
        let Some(index) = location.list_index() else {
            bug_check(BugCheckCode::MemoryManagementInvalid, [pfn.number(), 0, 0, 2]);
        };
        if entry.location != PageLocation::Active || entry.reference_count != 0 {
            bug_check(
                BugCheckCode::PfnListCorrupt,
                [pfn.number(), entry.location as u64, u64::from(entry.reference_count), 1],
            );
        }
        self.active -= 1;
        self.entry_mut(pfn).location = location;
        self.lists[index].push_back(&mut self.storage, pfn);
    }

    /// Move a frame between two lists.
    pub fn move_frame(&mut self, pfn: Pfn, from: PageLocation, to: PageLocation) {
        self.remove(from, pfn);
        self.insert(to, pfn);
    }

    /// Allocate: zeroed list, then free list, then repurpose standby.
    pub fn take_page(&mut self, consumer: MemoryConsumer, usage: PageUsage) -> Option<TakenPage> {
        let (pfn, zeroed) = if let Some(pfn) = self.lists[0].head() {
            self.remove(PageLocation::Zeroed, pfn);
            (pfn, true)
        } else if let Some(pfn) = self.lists[1].head() {
            self.remove(PageLocation::Free, pfn);
            (pfn, false)
        } else if let Some(pfn) = self.lists[2].head() {
            self.remove(PageLocation::Standby, pfn);
            if let Some(entry) = self.entry(pfn).saved_swap {
                self.transition.remove(entry);
            }
            trace!("repurposing standby frame {pfn}");
            (pfn, false)
        } else {
            return None;
        };
        self.claim(pfn, consumer, usage);
        Some(TakenPage { pfn, zeroed })
    }

    /// Give an in-transit frame its first reference.
    pub fn claim(&mut self, pfn: Pfn, consumer: MemoryConsumer, usage: PageUsage) {
        let entry = self.entry_mut(pfn);
        debug_assert_eq!(entry.location, PageLocation::Active);
        debug_assert_eq!(entry.reference_count, 0);
        let color = entry.flags.page_color();
        let cache = entry.flags.cache_attribute();
        entry.reference_count = 1;
        entry.share_count = 0;
        entry.flags = PfnFlags::new().with_page_color(color).with_cache_attribute(cache);
        entry.saved_swap = None;
        entry.pte = None;
        entry.pte_frame = None;
        entry.consumer = Some(consumer);
        entry.usage = usage;
        self.used[consumer.index()] += 1;
    }

    #[must_use]
    pub fn reference_count(&self, pfn: Pfn) -> u32 {
        self.entry(pfn).reference_count
    }

    /// Add a reference to an in-use frame.
    pub fn reference(&mut self, pfn: Pfn) {
        let entry = self.entry_mut(pfn);
        if entry.location != PageLocation::Active || entry.reference_count == 0 {
            let (location, count) = (entry.location as u64, u64::from(entry.reference_count));
            bug_check(BugCheckCode::PfnReferenceCount, [pfn.number(), location, count, 1]);
        }
        entry.reference_count += 1;
    }

    /// Drop a reference. At zero the frame leaves the active set; the
    /// location it lands on is returned alongside the new count.
    pub fn dereference(&mut self, pfn: Pfn) -> (u32, Option<PageLocation>) {
        let entry = self.entry_mut(pfn);
        if entry.location != PageLocation::Active || entry.reference_count == 0 {
            let (location, count) = (entry.location as u64, u64::from(entry.reference_count));
            bug_check(BugCheckCode::PfnReferenceCount, [pfn.number(), location, count, 0]);
        }
        entry.reference_count -= 1;
        let remaining = entry.reference_count;
        if remaining > 0 {
            return (remaining, None);
        }
        (0, Some(self.release(pfn)))
    }

    fn release(&mut self, pfn: Pfn) -> PageLocation {
        if self.entry(pfn).flink.is_some() {
            self.user_lru.remove(&mut self.storage, pfn);
        }
        let head = self.entry(pfn).rmap;
        self.rmap.clear(head);

        let entry = self.entry_mut(pfn);
        entry.rmap = None;
        entry.share_count = 0;
        entry.pte = None;
        entry.pte_frame = None;
        entry.usage = PageUsage::Unused;
        let consumer = entry.consumer;
        let backing = entry.saved_swap;
        let modified = entry.flags.modified();
        let retire = entry.flags.removal_requested();
        if let Some(consumer) = consumer {
            self.used[consumer.index()] -= 1;
        }

        let target = match backing {
            _ if retire => PageLocation::Bad,
            Some(_) if modified => PageLocation::Modified,
            Some(_) if consumer == Some(MemoryConsumer::Cache) => PageLocation::Standby,
            _ => PageLocation::Free,
        };
        match (backing, target) {
            (Some(swap), PageLocation::Modified | PageLocation::Standby) => {
                self.transition.insert(swap, pfn);
            }
            (Some(swap), _) => {
                self.transition.remove(swap);
                self.entry_mut(pfn).saved_swap = None;
            }
            (None, _) => {}
        }
        if target == PageLocation::Free || target == PageLocation::Bad {
            self.entry_mut(pfn).flags.set_modified(false);
        }
        self.insert(target, pfn);
        target
    }

    /// Bookkeeping for a new PTE referring to `pfn`.
    pub fn add_mapping(
        &mut self,
        pfn: Pfn,
        space: AddressSpaceId,
        address: VirtualAddress,
        pte_frame: Option<Pfn>,
    ) {
        self.reference(pfn);
        let head = self.entry(pfn).rmap;
        let head = self.rmap.insert(head, space, address);
        let entry = self.entry_mut(pfn);
        entry.rmap = Some(head);
        entry.share_count += 1;
        entry.usage = PageUsage::Mapped;
        if entry.pte.is_none() {
            entry.pte = Some(PteLocation { space, address });
            entry.pte_frame = pte_frame;
        }
        let join_lru = entry.consumer == Some(MemoryConsumer::User) && entry.flink.is_none();
        if join_lru {
            self.user_lru.push_back(&mut self.storage, pfn);
        }
    }

    /// Reverse of [`add_mapping`](Self::add_mapping). Returns the remaining
    /// reference count.
    pub fn remove_mapping(&mut self, pfn: Pfn, space: AddressSpaceId, address: VirtualAddress) -> u32 {
        if !self.rmap_remove(pfn, space, address) {
            bug_check(
                BugCheckCode::MemoryManagementInvalid,
                [pfn.number(), u64::from(space.as_u32()), address.as_u64(), 3],
            );
        }
        let entry = self.entry_mut(pfn);
        entry.share_count = entry.share_count.saturating_sub(1);
        if entry.pte == Some(PteLocation { space, address }) {
            entry.pte = None;
        }
        self.dereference(pfn).0
    }

    pub fn rmap_insert(&mut self, pfn: Pfn, space: AddressSpaceId, address: VirtualAddress) {
        let head = self.entry(pfn).rmap;
        let head = self.rmap.insert(head, space, address);
        self.entry_mut(pfn).rmap = Some(head);
    }

    pub fn rmap_remove(&mut self, pfn: Pfn, space: AddressSpaceId, address: VirtualAddress) -> bool {
        let head = self.entry(pfn).rmap;
        let (head, found) = self.rmap.remove(head, space, address);
        self.entry_mut(pfn).rmap = head;
        found
    }

    /// Append the mappers of `pfn` to `out`. Returns `false`, leaving `out`
    /// untouched, if that would need more than its spare capacity.
    pub fn rmap_copy_into(&self, pfn: Pfn, out: &mut Vec<Mapper>) -> bool {
        let head = self.entry(pfn).rmap;
        if self.rmap.iter(head).count() > out.capacity() - out.len() {
            return false;
        }
        out.extend(self.rmap.iter(head));
        true
    }

    /// The mapper of a frame mapped exactly once.
    #[must_use]
    pub fn sole_mapper(&self, pfn: Pfn) -> Option<Mapper> {
        let mut mappers = self.rmap.iter(self.entry(pfn).rmap);
        let first = mappers.next()?;
        mappers.next().is_none().then_some(first)
    }

    #[must_use]
    pub fn rmap_count(&self, pfn: Pfn) -> usize {
        self.rmap.iter(self.entry(pfn).rmap).count()
    }

    /// Rmap nodes in use across all frames.
    #[must_use]
    pub const fn rmap_nodes(&self) -> usize {
        self.rmap.live()
    }

    /// Rmap nodes that can be linked without the arena growing.
    #[must_use]
    pub fn rmap_spare(&self) -> usize {
        self.rmap.spare()
    }

    /// Make room for `additional` rmap nodes. Only for use before the
    /// database is shared; afterwards see [`rmap_adopt`](Self::rmap_adopt).
    pub fn rmap_reserve(&mut self, additional: usize) {
        self.rmap.reserve(additional);
    }

    /// Move the rmap arena into `storage` if that is larger, handing the
    /// old storage back so it can be dropped outside the frame lock.
    pub fn rmap_adopt(&mut self, storage: Vec<RmapNode>) -> Vec<RmapNode> {
        self.rmap.adopt(storage)
    }

    #[must_use]
    pub fn rmap_capacity(&self) -> usize {
        self.rmap.capacity()
    }

    /// Install the transition table for paging file `file`.
    pub fn attach_paging_file(&mut self, file: u8, table: SlotTable) -> SlotTable {
        self.transition.attach(file, table)
    }

    pub fn set_modified(&mut self, pfn: Pfn, modified: bool) {
        self.entry_mut(pfn).flags.set_modified(modified);
    }

    pub fn update_flags(&mut self, pfn: Pfn, f: impl FnOnce(&mut PfnFlags)) {
        f(&mut self.entry_mut(pfn).flags);
    }

    #[must_use]
    pub fn saved_swap_entry(&self, pfn: Pfn) -> Option<SwapEntry> {
        self.entry(pfn).saved_swap
    }

    /// Record where an in-use frame's contents live in backing store.
    pub fn set_saved_swap_entry(&mut self, pfn: Pfn, entry: Option<SwapEntry>) {
        self.entry_mut(pfn).saved_swap = entry;
    }

    /// Whether the frame is in use (active with at least one reference).
    #[must_use]
    pub fn is_in_use(&self, pfn: Pfn) -> bool {
        let entry = self.entry(pfn);
        entry.location == PageLocation::Active && entry.reference_count > 0
    }

    #[must_use]
    pub fn transition_frame(&self, entry: SwapEntry) -> Option<Pfn> {
        self.transition.get(entry)
    }

    /// Reclaim the frame still holding `swap`'s contents for a new mapping.
    ///
    /// A claimed frame is active with one reference charged to `consumer`,
    /// keeps its contents and the modified bit, and is no longer indexed.
    pub fn claim_transition(&mut self, swap: SwapEntry, consumer: MemoryConsumer) -> Transition {
        let Some(pfn) = self.transition_frame(swap) else {
            return Transition::Absent;
        };
        let entry = self.entry(pfn);
        if entry.flags.io_in_progress() {
            return Transition::Busy(pfn);
        }
        let location = entry.location;
        let modified = entry.flags.modified();
        self.transition.remove(swap);
        self.remove(location, pfn);
        self.claim(pfn, consumer, PageUsage::Mapped);
        self.entry_mut(pfn).flags.set_modified(modified);
        Transition::Claimed(pfn)
    }

    /// Forget the frame holding `swap`'s contents; it goes to the free list.
    pub fn discard_transition(&mut self, swap: SwapEntry) -> Transition {
        let Some(pfn) = self.transition_frame(swap) else {
            return Transition::Absent;
        };
        let entry = self.entry(pfn);
        if entry.flags.io_in_progress() {
            return Transition::Busy(pfn);
        }
        let location = entry.location;
        self.transition.remove(swap);
        let entry = self.entry_mut(pfn);
        entry.saved_swap = None;
        entry.flags.set_modified(false);
        self.move_frame(pfn, location, PageLocation::Free);
        Transition::Claimed(pfn)
    }

    /// Oldest modified frame not already being written.
    #[must_use]
    pub fn next_modified(&self) -> Option<Pfn> {
        self.lists[3]
            .iter(&self.storage)
            // SAFETY: listed frames are initialized.
            .find(|&pfn| unsafe { !self.storage.get(pfn).flags.write_in_progress() })
    }

    /// Mark a modified frame as being written; returns its swap entry.
    pub fn begin_write(&mut self, pfn: Pfn) -> Option<SwapEntry> {
        let entry = self.entry_mut(pfn);
        if entry.location != PageLocation::Modified || entry.flags.write_in_progress() {
            return None;
        }
        let swap = entry.saved_swap?;
        entry.flags.set_write_in_progress(true);
        Some(swap)
    }

    /// Finish a write started with [`begin_write`](Self::begin_write).
    ///
    /// Success sends anonymous frames to the free list and cache frames to
    /// standby; failure parks the frame on the modified-no-write list.
    pub fn end_write(&mut self, pfn: Pfn, written: bool) -> PageLocation {
        let entry = self.entry_mut(pfn);
        entry.flags.set_write_in_progress(false);
        let cache = entry.consumer == Some(MemoryConsumer::Cache);
        let swap = entry.saved_swap;
        let target = if !written {
            PageLocation::ModifiedNoWrite
        } else if cache {
            entry.flags.set_modified(false);
            PageLocation::Standby
        } else {
            entry.flags.set_modified(false);
            entry.saved_swap = None;
            if let Some(swap) = swap {
                self.transition.remove(swap);
            }
            PageLocation::Free
        };
        self.move_frame(pfn, PageLocation::Modified, target);
        target
    }

    /// Oldest frame on the user LRU list.
    #[must_use]
    pub const fn lru_first(&self) -> Option<Pfn> {
        self.user_lru.head()
    }

    #[must_use]
    pub fn lru_next(&self, pfn: Pfn) -> Option<Pfn> {
        let entry = self.entry(pfn);
        if entry.location != PageLocation::Active {
            return None;
        }
        let next = entry.flink?;
        (Some(next) != self.user_lru.head()).then_some(next)
    }

    /// Move a user frame to the young end of the LRU list.
    pub fn lru_touch(&mut self, pfn: Pfn) {
        let entry = self.entry(pfn);
        if entry.location == PageLocation::Active && entry.flink.is_some() {
            self.user_lru.remove(&mut self.storage, pfn);
            self.user_lru.push_back(&mut self.storage, pfn);
        }
    }

    #[must_use]
    pub const fn lru_len(&self) -> usize {
        self.user_lru.total()
    }

    /// Ask for a frame to be retired. Free frames go to the bad list now,
    /// in-use frames once their last reference drops.
    pub fn request_removal(&mut self, pfn: Pfn) {
        let location = self.entry(pfn).location;
        self.entry_mut(pfn).flags.set_removal_requested(true);
        if matches!(location, PageLocation::Free | PageLocation::Zeroed) {
            self.move_frame(pfn, location, PageLocation::Bad);
        }
    }

    /// Full consistency check; fatal on any mismatch.
    ///
    /// Walks every list, checks each listed frame's location, and that the
    /// totals add up to the tracked frames. Idle frames must have no rmap.
    pub fn verify(&self) {
        let mut listed = 0;
        for (index, list) in self.lists.iter().enumerate() {
            list.verify(&self.storage);
            let expected = PageLocation::LISTS[index];
            for pfn in list.iter(&self.storage) {
                // SAFETY: listed frames are initialized.
                let entry = unsafe { self.storage.get(pfn) };
                if entry.location != expected || entry.reference_count != 0 || entry.rmap.is_some() {
                    bug_check(
                        BugCheckCode::PfnListCorrupt,
                        [pfn.number(), entry.location as u64, expected as u64, 2],
                    );
                }
                listed += 1;
            }
        }
        self.user_lru.verify(&self.storage);
        if listed + self.active != self.tracked {
            bug_check(
                BugCheckCode::PfnListCorrupt,
                [listed as u64, self.active as u64, self.tracked as u64, 3],
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::SwapEntry;

    fn database(free: u64) -> PfnDatabase {
        let mut db = PfnDatabase::new(PfnStorage::boxed(0x100 + free as usize));
        db.add_range(0x10, 0x10, PageLocation::Active, PageUsage::Boot);
        db.add_range(0x100, free, PageLocation::Free, PageUsage::Unused);
        db.finish_init();
        for file in 0..2 {
            db.attach_paging_file(file, alloc::vec![None; 16]);
        }
        db.rmap_reserve(16);
        db
    }

    #[test]
    fn initial_counts_add_up() {
        let db = database(64);
        let counts = db.counts();
        assert_eq!(counts.free, 64);
        assert_eq!(counts.active, 16);
        assert_eq!(counts.listed() + counts.active, counts.tracked);
        assert_eq!(db.consumer_used(MemoryConsumer::System), 16);
        assert!(db.pfn(0x20).is_none());
        assert!(db.pfn(0x1F).is_some());
    }

    #[test]
    fn zeroed_list_is_preferred() {
        let mut db = database(4);
        db.move_frame(Pfn::new(0x102), PageLocation::Free, PageLocation::Zeroed);
        let page = db.take_page(MemoryConsumer::User, PageUsage::Private).unwrap();
        assert_eq!(page, TakenPage { pfn: Pfn::new(0x102), zeroed: true });
        let next = db.take_page(MemoryConsumer::User, PageUsage::Private).unwrap();
        assert_eq!(next.pfn, Pfn::new(0x100));
        assert!(!next.zeroed);
        assert_eq!(db.consumer_used(MemoryConsumer::User), 2);
    }

    #[test]
    fn dereference_to_zero_picks_list() {
        let mut db = database(4);
        let clean = db.take_page(MemoryConsumer::User, PageUsage::Private).unwrap().pfn;
        assert_eq!(db.dereference(clean), (0, Some(PageLocation::Free)));

        let dirty = db.take_page(MemoryConsumer::User, PageUsage::Private).unwrap().pfn;
        let swap = SwapEntry::from_parts(0, 7);
        db.set_saved_swap_entry(dirty, Some(swap));
        db.set_modified(dirty, true);
        assert_eq!(db.dereference(dirty), (0, Some(PageLocation::Modified)));
        assert_eq!(db.transition_frame(swap), Some(dirty));

        let cached = db.take_page(MemoryConsumer::Cache, PageUsage::Private).unwrap().pfn;
        db.set_saved_swap_entry(cached, Some(SwapEntry::from_parts(0, 8)));
        assert_eq!(db.dereference(cached), (0, Some(PageLocation::Standby)));
        db.verify();
    }

    #[test]
    fn standby_is_repurposed_last() {
        let mut db = database(1);
        let cached = db.take_page(MemoryConsumer::Cache, PageUsage::Private).unwrap().pfn;
        let swap = SwapEntry::from_parts(1, 1);
        db.set_saved_swap_entry(cached, Some(swap));
        db.dereference(cached);
        assert_eq!(db.counts().standby, 1);

        let again = db.take_page(MemoryConsumer::User, PageUsage::Private).unwrap();
        assert_eq!(again.pfn, cached);
        assert_eq!(db.transition_frame(swap), None);
        assert_eq!(db.saved_swap_entry(cached), None);
        assert!(db.take_page(MemoryConsumer::User, PageUsage::Private).is_none());
    }

    #[test]
    #[should_panic(expected = "PFN_REFERENCE_COUNT")]
    fn double_free_is_fatal() {
        let mut db = database(2);
        let pfn = db.take_page(MemoryConsumer::System, PageUsage::Private).unwrap().pfn;
        db.dereference(pfn);
        db.dereference(pfn);
    }

    #[test]
    #[should_panic(expected = "PAGE_FRAME_OUT_OF_RANGE")]
    fn unmanaged_frame_is_fatal() {
        let db = database(2);
        let _ = db.entry(Pfn::new(0x50));
    }

    #[test]
    fn mapping_references_and_rmap() {
        let mut db = database(2);
        let pfn = db.take_page(MemoryConsumer::User, PageUsage::Private).unwrap().pfn;
        let (p1, p2) = (AddressSpaceId::new(1), AddressSpaceId::new(2));
        let va = VirtualAddress::new(0x40_0000);
        db.add_mapping(pfn, p1, va, None);
        db.add_mapping(pfn, p2, va, None);
        assert_eq!(db.reference_count(pfn), 3);
        assert_eq!(db.entry(pfn).share_count(), 2);
        assert_eq!(db.rmap_count(pfn), 2);
        assert_eq!(db.lru_len(), 1);

        assert_eq!(db.remove_mapping(pfn, p1, va), 2);
        assert_eq!(db.dereference(pfn), (1, None));
        assert_eq!(db.remove_mapping(pfn, p2, va), 0);
        assert!(!db.entry(pfn).has_rmap());
        assert_eq!(db.lru_len(), 0);
        assert_eq!(db.rmap_nodes(), 0);
        db.verify();
    }

    #[test]
    fn transition_claim_and_busy() {
        let mut db = database(2);
        let pfn = db.take_page(MemoryConsumer::User, PageUsage::Private).unwrap().pfn;
        let swap = SwapEntry::from_parts(0, 3);
        db.set_saved_swap_entry(pfn, Some(swap));
        db.set_modified(pfn, true);
        db.dereference(pfn);

        assert_eq!(db.begin_write(pfn), Some(swap));
        assert_eq!(
            db.claim_transition(swap, MemoryConsumer::User),
            Transition::Busy(pfn)
        );
        assert_eq!(db.end_write(pfn, false), PageLocation::ModifiedNoWrite);
        assert_eq!(
            db.claim_transition(swap, MemoryConsumer::User),
            Transition::Claimed(pfn)
        );
        assert!(db.is_in_use(pfn));
        assert!(db.entry(pfn).flags().modified());
        assert_eq!(db.claim_transition(swap, MemoryConsumer::User), Transition::Absent);
        db.verify();
    }

    #[test]
    fn removal_request_retires_frames() {
        let mut db = database(2);
        db.request_removal(Pfn::new(0x101));
        assert_eq!(db.counts().bad, 1);
        let pfn = db.take_page(MemoryConsumer::System, PageUsage::Private).unwrap().pfn;
        db.request_removal(pfn);
        assert_eq!(db.dereference(pfn).1, Some(PageLocation::Bad));
        assert_eq!(db.counts().bad, 2);
    }
}
