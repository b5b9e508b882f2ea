//! # Memory areas
//!
//! Each address space keeps its reserved virtual ranges in an ordered tree
//! keyed by starting page. Areas never overlap; lookups by address or range
//! are `O(log n)`, and gap searches walk the tree in address order.

mod region;

pub use region::{AlteredRange, Region, RegionList, RegionState};

use crate::pfn::Pfn;
use crate::protection::Protection;
use crate::swap::SwapEntry;
use alloc::collections::BTreeMap;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PAGE_SHIFT, VirtualAddress, VirtualPageNumber};

/// What an area is used for.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AreaKind {
    /// View of a section (shared or image mapping).
    SectionView,
    /// File cache window.
    Cache,
    /// Private, demand-zero memory.
    VirtualMemory,
    /// Kernel thread stack; the lowest page is a guard page.
    KernelStack,
    /// Fixed system region set up at boot.
    System,
}

#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct AreaFlags {
    /// Created at boot; never freed.
    pub is_static: bool,
    /// Pages are never paged out.
    pub locked: bool,
    /// Place the area at the highest fitting gap when no address is given.
    pub top_down: bool,
    #[bits(5)]
    __: u8,
}

/// Opaque owner tag, e.g. the segment a section view maps.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SegmentTag(pub u64);

/// A reserved virtual range.
#[derive(Debug, Clone)]
pub struct MemoryArea {
    start: VirtualPageNumber,
    end: VirtualPageNumber,
    kind: AreaKind,
    protection: Protection,
    flags: AreaFlags,
    segment: Option<SegmentTag>,
    regions: RegionList,
}

impl MemoryArea {
    #[must_use]
    pub fn new(
        start: VirtualPageNumber,
        pages: u64,
        kind: AreaKind,
        protection: Protection,
        flags: AreaFlags,
    ) -> Self {
        let end = start + pages;
        Self {
            start,
            end,
            kind,
            protection,
            flags,
            segment: None,
            regions: RegionList::new(start, end, RegionState::Committed, protection),
        }
    }

    #[must_use]
    pub const fn with_segment(mut self, segment: SegmentTag) -> Self {
        self.segment = Some(segment);
        self
    }

    #[inline]
    #[must_use]
    pub const fn start_vpn(&self) -> VirtualPageNumber {
        self.start
    }

    /// One past the last page.
    #[inline]
    #[must_use]
    pub const fn end_vpn(&self) -> VirtualPageNumber {
        self.end
    }

    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start.base()
    }

    #[must_use]
    pub fn pages(&self) -> u64 {
        self.end - self.start
    }

    #[must_use]
    pub const fn kind(&self) -> AreaKind {
        self.kind
    }

    /// Protection the area was created with.
    #[must_use]
    pub const fn protection(&self) -> Protection {
        self.protection
    }

    #[must_use]
    pub const fn flags(&self) -> AreaFlags {
        self.flags
    }

    #[must_use]
    pub const fn segment(&self) -> Option<SegmentTag> {
        self.segment
    }

    #[must_use]
    pub const fn regions(&self) -> &RegionList {
        &self.regions
    }

    pub const fn regions_mut(&mut self) -> &mut RegionList {
        &mut self.regions
    }

    #[must_use]
    pub fn contains(&self, vpn: VirtualPageNumber) -> bool {
        self.start <= vpn && vpn < self.end
    }

    /// State and protection of the page at `vpn`.
    #[must_use]
    pub fn page_attributes(&self, vpn: VirtualPageNumber) -> Option<(RegionState, Protection)> {
        self.regions.find(vpn).map(|r| (r.state, r.protection))
    }

    /// Page addresses from start to end.
    pub fn page_addresses(&self) -> impl Iterator<Item = VirtualAddress> + use<> {
        let (start, pages) = (self.start, self.pages());
        (0..pages).map(move |i| (start + i).base())
    }
}

/// What the owner of a page being freed wants done with it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageDisposition {
    /// Drop the contents.
    Discard,
    /// Contents still matter: queue the frame for the modified page writer.
    WriteBack,
    /// Keep the contents in a paging file slot that the caller takes over.
    Swap,
}

/// A mapped or swapped page reported to the free-area callback.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FreedPage {
    pub address: VirtualAddress,
    /// Resident frame, if present or disabled.
    pub frame: Option<Pfn>,
    /// Paging file slot, if the page was swapped out.
    pub swap: Option<SwapEntry>,
    pub dirty: bool,
}

/// Ordered, non-overlapping areas of one address space.
pub struct AreaTree {
    areas: BTreeMap<VirtualPageNumber, MemoryArea>,
    low: VirtualPageNumber,
    /// One past the last usable page.
    high: VirtualPageNumber,
}

impl AreaTree {
    /// Tree for the inclusive range `[low, high]`.
    #[must_use]
    pub const fn new(low: VirtualAddress, high: VirtualAddress) -> Self {
        Self {
            areas: BTreeMap::new(),
            low: VirtualPageNumber::new(low.as_u64() >> PAGE_SHIFT),
            high: VirtualPageNumber::new((high.as_u64() >> PAGE_SHIFT) + 1),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.areas.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryArea> {
        self.areas.values()
    }

    /// Insert an area; `None` if it leaves the space or overlaps another.
    pub fn insert(&mut self, area: MemoryArea) -> Result<(), MemoryArea> {
        let in_bounds = area.start >= self.low && area.end <= self.high && area.start < area.end;
        if !in_bounds || self.find_by_range(area.start, area.end).is_some() {
            return Err(area);
        }
        self.areas.insert(area.start, area);
        Ok(())
    }

    pub fn remove(&mut self, start: VirtualPageNumber) -> Option<MemoryArea> {
        self.areas.remove(&start)
    }

    /// Area containing `address`.
    #[must_use]
    pub fn find_by_address(&self, address: VirtualAddress) -> Option<&MemoryArea> {
        let vpn = address.page_number();
        self.areas
            .range(..=vpn)
            .next_back()
            .map(|(_, area)| area)
            .filter(|area| area.contains(vpn))
    }

    pub fn find_by_address_mut(&mut self, address: VirtualAddress) -> Option<&mut MemoryArea> {
        let vpn = address.page_number();
        self.areas
            .range_mut(..=vpn)
            .next_back()
            .map(|(_, area)| area)
            .filter(|area| area.contains(vpn))
    }

    /// First area overlapping `[start, end)`.
    #[must_use]
    pub fn find_by_range(&self, start: VirtualPageNumber, end: VirtualPageNumber) -> Option<&MemoryArea> {
        if let Some((_, area)) = self.areas.range(..=start).next_back()
            && area.end > start
        {
            return Some(area);
        }
        self.areas
            .range(start..end)
            .next()
            .map(|(_, area)| area)
    }

    /// Lowest (or highest) gap of `pages` pages aligned to `granularity`
    /// pages, within the tree's bounds.
    #[must_use]
    pub fn find_gap(&self, pages: u64, granularity: u64, top_down: bool) -> Option<VirtualPageNumber> {
        self.find_gap_in(pages, granularity, top_down, self.low, self.high)
    }

    /// Like [`find_gap`](Self::find_gap), restricted to `[low, high)`.
    #[must_use]
    pub fn find_gap_in(
        &self,
        pages: u64,
        granularity: u64,
        top_down: bool,
        low: VirtualPageNumber,
        high: VirtualPageNumber,
    ) -> Option<VirtualPageNumber> {
        if pages == 0 {
            return None;
        }
        let granularity = granularity.max(1);
        let align_up = |v: u64| v.checked_next_multiple_of(granularity);
        let align_down = |v: u64| v - v % granularity;
        let (low, high) = (low.as_u64().max(self.low.as_u64()), high.as_u64().min(self.high.as_u64()));

        if top_down {
            let mut limit = high;
            for area in self.areas.values().rev() {
                let (a_start, a_end) = (area.start.as_u64(), area.end.as_u64());
                if a_start >= limit {
                    continue;
                }
                if let Some(candidate) = limit.checked_sub(pages).map(align_down)
                    && candidate >= a_end
                    && candidate >= low
                {
                    return Some(VirtualPageNumber::new(candidate));
                }
                limit = a_start;
                if limit <= low {
                    return None;
                }
            }
            let candidate = align_down(limit.checked_sub(pages)?);
            (candidate >= low).then(|| VirtualPageNumber::new(candidate))
        } else {
            let mut cursor = align_up(low)?;
            for area in self.areas.values() {
                let (a_start, a_end) = (area.start.as_u64(), area.end.as_u64());
                if a_end <= cursor {
                    continue;
                }
                if cursor + pages <= a_start.min(high) {
                    return Some(VirtualPageNumber::new(cursor));
                }
                cursor = align_up(a_end)?;
                if cursor >= high {
                    return None;
                }
            }
            (cursor + pages <= high).then(|| VirtualPageNumber::new(cursor))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> AreaTree {
        AreaTree::new(VirtualAddress::new(0x1_0000), VirtualAddress::new(0x7FF_FFFE_FFFF))
    }

    fn area(start: u64, pages: u64) -> MemoryArea {
        MemoryArea::new(
            VirtualPageNumber::new(start),
            pages,
            AreaKind::VirtualMemory,
            Protection::READ_WRITE,
            AreaFlags::new(),
        )
    }

    #[test]
    fn lookup_by_address_and_range() {
        let mut t = tree();
        t.insert(area(100, 10)).unwrap();
        t.insert(area(200, 5)).unwrap();

        let found = t.find_by_address(VirtualPageNumber::new(105).base()).unwrap();
        assert_eq!(found.start_vpn(), VirtualPageNumber::new(100));
        assert!(t.find_by_address(VirtualPageNumber::new(110).base()).is_none());
        assert!(
            t.find_by_range(VirtualPageNumber::new(150), VirtualPageNumber::new(201))
                .is_some_and(|a| a.start_vpn() == VirtualPageNumber::new(200))
        );
        assert!(t.find_by_range(VirtualPageNumber::new(110), VirtualPageNumber::new(200)).is_none());
    }

    #[test]
    fn overlapping_insert_is_rejected() {
        let mut t = tree();
        t.insert(area(100, 10)).unwrap();
        assert!(t.insert(area(109, 2)).is_err());
        assert!(t.insert(area(95, 6)).is_err());
        assert!(t.insert(area(110, 1)).is_ok());
        assert!(t.insert(area(1, 1)).is_err(), "below the lowest user page");
    }

    #[test]
    fn gaps_bottom_up_and_top_down() {
        let mut t = tree();
        t.insert(area(0x10, 0x10)).unwrap();
        t.insert(area(0x30, 0x10)).unwrap();

        assert_eq!(t.find_gap(0x10, 0x10, false), Some(VirtualPageNumber::new(0x20)));
        assert_eq!(t.find_gap(0x11, 0x10, false), Some(VirtualPageNumber::new(0x40)));

        let top = t.find_gap(0x10, 0x10, true).unwrap();
        assert_eq!(top.as_u64() + 0x10, 0x7FF_FFFF_0);
        assert_eq!(
            t.find_gap_in(0x10, 1, true, VirtualPageNumber::new(0x10), VirtualPageNumber::new(0x40)),
            Some(VirtualPageNumber::new(0x20))
        );
        assert_eq!(
            t.find_gap_in(0x11, 1, true, VirtualPageNumber::new(0x10), VirtualPageNumber::new(0x40)),
            None
        );
    }
}
