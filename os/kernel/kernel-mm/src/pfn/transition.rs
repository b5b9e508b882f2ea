//! Swap slot to frame index for pages that left memory but not their frame.
//!
//! One table per paging file, one cell per slot. Tables are built when the
//! file is registered and only ever moved in under the frame lock, so
//! indexing and unindexing frames never allocates.

use super::Pfn;
use crate::error::{BugCheckCode, bug_check};
use crate::swap::{MAX_PAGING_FILES, SwapEntry};
use alloc::vec::Vec;

/// Per-slot cells of one paging file.
pub type SlotTable = Vec<Option<Pfn>>;

pub(super) struct TransitionIndex {
    files: [SlotTable; MAX_PAGING_FILES],
}

impl TransitionIndex {
    pub(super) const fn new() -> Self {
        Self {
            files: [const { Vec::new() }; MAX_PAGING_FILES],
        }
    }

    /// Install the table for paging file `file`, returning the previous one.
    pub(super) fn attach(&mut self, file: u8, table: SlotTable) -> SlotTable {
        match self.files.get_mut(usize::from(file)) {
            Some(cell) => core::mem::replace(cell, table),
            None => bug_check(BugCheckCode::MemoryManagementInvalid, [u64::from(file), 0, 0, 7]),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn cell(&self, entry: SwapEntry) -> Option<&Option<Pfn>> {
        self.files.get(usize::from(entry.file()))?.get(entry.slot() as usize)
    }

    #[must_use]
    pub(super) fn get(&self, entry: SwapEntry) -> Option<Pfn> {
        self.cell(entry).copied().flatten()
    }

    /// Index `pfn` by `entry`. The slot must belong to an attached file.
    #[allow(clippy::cast_possible_truncation)]
    pub(super) fn insert(&mut self, entry: SwapEntry, pfn: Pfn) {
        let cell = self
            .files
            .get_mut(usize::from(entry.file()))
            .and_then(|table| table.get_mut(entry.slot() as usize));
        match cell {
            Some(cell) => *cell = Some(pfn),
            None => bug_check(
                BugCheckCode::MemoryManagementInvalid,
                [entry.locator(), pfn.number(), 0, 8],
            ),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(super) fn remove(&mut self, entry: SwapEntry) {
        if let Some(cell) = self
            .files
            .get_mut(usize::from(entry.file()))
            .and_then(|table| table.get_mut(entry.slot() as usize))
        {
            *cell = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn cells_follow_their_file() {
        let mut index = TransitionIndex::new();
        assert!(index.attach(2, vec![None; 4]).is_empty());
        let entry = SwapEntry::from_parts(2, 3);
        index.insert(entry, Pfn::new(0x42));
        assert_eq!(index.get(entry), Some(Pfn::new(0x42)));
        assert_eq!(index.get(SwapEntry::from_parts(0, 3)), None);
        index.remove(entry);
        assert_eq!(index.get(entry), None);
        // slots past the table are simply not indexed
        index.remove(SwapEntry::from_parts(2, 9));
        assert_eq!(index.get(SwapEntry::from_parts(2, 9)), None);
    }

    #[test]
    #[should_panic(expected = "MEMORY_MANAGEMENT")]
    fn indexing_an_unattached_file_is_fatal() {
        let mut index = TransitionIndex::new();
        index.insert(SwapEntry::from_parts(5, 0), Pfn::new(1));
    }
}
