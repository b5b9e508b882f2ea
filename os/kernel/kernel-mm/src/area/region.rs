use crate::protection::Protection;
use alloc::vec;
use alloc::vec::Vec;
use kernel_memory_addresses::VirtualPageNumber;

/// Whether a run of pages may be faulted in.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegionState {
    /// Address range reserved; accesses fault.
    Reserved,
    /// Backed on demand.
    Committed,
}

/// A run of pages within one area with uniform state and protection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Region {
    pub start: VirtualPageNumber,
    pub end: VirtualPageNumber,
    pub state: RegionState,
    pub protection: Protection,
}

impl Region {
    #[must_use]
    pub fn pages(&self) -> u64 {
        self.end - self.start
    }
}

/// A sub-range whose state or protection an [`RegionList::alter`] changed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AlteredRange {
    pub start: VirtualPageNumber,
    pub end: VirtualPageNumber,
    pub old_state: RegionState,
    pub old_protection: Protection,
}

/// Sorted, gap-free partition of an area into regions.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RegionList {
    regions: Vec<Region>,
}

impl RegionList {
    #[must_use]
    pub fn new(
        start: VirtualPageNumber,
        end: VirtualPageNumber,
        state: RegionState,
        protection: Protection,
    ) -> Self {
        Self {
            regions: vec![Region {
                start,
                end,
                state,
                protection,
            }],
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Region] {
        &self.regions
    }

    /// Region containing `vpn`.
    #[must_use]
    pub fn find(&self, vpn: VirtualPageNumber) -> Option<&Region> {
        let at = self.regions.partition_point(|r| r.end <= vpn);
        self.regions.get(at).filter(|r| r.start <= vpn)
    }

    /// Give `[start, end)` a new state and protection.
    ///
    /// Regions straddling the boundaries are split; neighbours that end up
    /// identical are merged again. Returns the runs whose attributes actually
    /// changed, with their previous values, so the caller can fix up the
    /// page tables.
    pub fn alter(
        &mut self,
        start: VirtualPageNumber,
        end: VirtualPageNumber,
        state: RegionState,
        protection: Protection,
    ) -> Vec<AlteredRange> {
        self.split_at(start);
        self.split_at(end);

        let mut altered = Vec::new();
        for region in &mut self.regions {
            if region.start >= start && region.end <= end {
                if region.state != state || region.protection != protection {
                    altered.push(AlteredRange {
                        start: region.start,
                        end: region.end,
                        old_state: region.state,
                        old_protection: region.protection,
                    });
                }
                region.state = state;
                region.protection = protection;
            }
        }
        self.coalesce();
        altered
    }

    fn split_at(&mut self, at: VirtualPageNumber) {
        let index = self.regions.partition_point(|r| r.end <= at);
        let Some(region) = self.regions.get_mut(index) else {
            return;
        };
        if region.start < at && at < region.end {
            let mut upper = *region;
            region.end = at;
            upper.start = at;
            self.regions.insert(index + 1, upper);
        }
    }

    fn coalesce(&mut self) {
        self.regions.dedup_by(|next, prev| {
            let same = prev.end == next.start
                && prev.state == next.state
                && prev.protection == next.protection;
            if same {
                prev.end = next.end;
            }
            same
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vpn(n: u64) -> VirtualPageNumber {
        VirtualPageNumber::new(n)
    }

    #[test]
    fn alter_splits_and_reports_old_attributes() {
        let mut list = RegionList::new(vpn(10), vpn(20), RegionState::Reserved, Protection::READ_WRITE);
        let changed = list.alter(vpn(12), vpn(15), RegionState::Committed, Protection::READ_ONLY);
        assert_eq!(
            changed,
            [AlteredRange {
                start: vpn(12),
                end: vpn(15),
                old_state: RegionState::Reserved,
                old_protection: Protection::READ_WRITE,
            }]
        );
        assert_eq!(list.as_slice().len(), 3);
        assert_eq!(list.find(vpn(14)).unwrap().protection, Protection::READ_ONLY);
        assert_eq!(list.find(vpn(15)).unwrap().state, RegionState::Reserved);
        assert!(list.find(vpn(20)).is_none());
    }

    #[test]
    fn alter_back_coalesces() {
        let mut list = RegionList::new(vpn(0), vpn(8), RegionState::Committed, Protection::READ_WRITE);
        list.alter(vpn(2), vpn(4), RegionState::Committed, Protection::READ_ONLY);
        list.alter(vpn(2), vpn(4), RegionState::Committed, Protection::READ_WRITE);
        assert_eq!(list.as_slice().len(), 1);
        assert!(list.alter(vpn(0), vpn(8), RegionState::Committed, Protection::READ_WRITE).is_empty());
    }
}
