use crate::PageTableEntry;
use core::fmt;
use kernel_memory_addresses::VirtualAddress;

/// Number of entries in one table at any level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// One 4 KiB page table (any level).
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

const _: () = {
    assert!(size_of::<PageTable>() == 4096);
    assert!(align_of::<PageTable>() == 4096);
};

impl PageTable {
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::zero());
    }

    #[inline]
    #[must_use]
    pub const fn entry(&self, index: usize) -> &PageTableEntry {
        &self.entries[index]
    }

    #[inline]
    pub const fn entry_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }

    /// No entry carries any state (present or software).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(PageTableEntry::is_empty)
    }
}

/// Level within the 4-level hierarchy, top first.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TableLevel {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl TableLevel {
    pub const ALL: [Self; 4] = [Self::Pml4, Self::Pdpt, Self::Pd, Self::Pt];

    /// Bit position of this level's index within a virtual address.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => 30,
            Self::Pd => 21,
            Self::Pt => 12,
        }
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index_of(self, va: VirtualAddress) -> usize {
        ((va.as_u64() >> self.shift()) & 0x1FF) as usize
    }

    /// The level below, or `None` for the PT level.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }
}

impl fmt::Display for TableLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pml4 => "PML4",
            Self::Pdpt => "PDPT",
            Self::Pd => "PD",
            Self::Pt => "PT",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_split_the_address() {
        let va = VirtualAddress::new(0xFFFF_F8A0_1234_5000);
        let parts = TableLevel::ALL.map(|l| l.index_of(va));
        let rebuilt = (parts[0] as u64) << 39
            | (parts[1] as u64) << 30
            | (parts[2] as u64) << 21
            | (parts[3] as u64) << 12;
        assert_eq!(VirtualAddress::canonicalize(rebuilt), va);
    }

    #[test]
    fn levels_chain_downwards() {
        let mut level = TableLevel::Pml4;
        let mut seen = 1;
        while let Some(next) = level.next() {
            assert!(next > level);
            level = next;
            seen += 1;
        }
        assert_eq!(seen, 4);
        assert_eq!(level, TableLevel::Pt);
    }
}
