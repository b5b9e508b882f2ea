use super::{Pfn, PfnEntry};
use alloc::boxed::Box;
use core::mem::MaybeUninit;
use core::ptr::NonNull;

/// Backing array of the frame database.
///
/// In the kernel the array lives at the PFN database virtual range and only
/// the pages describing managed frames are mapped. Host builds use a heap
/// allocation of the same shape. Either way an entry is only valid after
/// [`PfnStorage::write`] initialized it; the database guarantees that by
/// checking the managed ranges before every access.
pub struct PfnStorage {
    base: NonNull<PfnEntry>,
    len: usize,
    owned: bool,
}

// SAFETY: the storage is only ever reached through the frame lock.
unsafe impl Send for PfnStorage {}

impl PfnStorage {
    /// Use memory at `base` for `len` entries.
    ///
    /// # Safety
    /// Every entry later initialized through [`write`](Self::write) must lie
    /// in mapped, writable memory that nothing else uses for the lifetime of
    /// the storage.
    #[must_use]
    pub const unsafe fn from_raw(base: NonNull<PfnEntry>, len: usize) -> Self {
        Self {
            base,
            len,
            owned: false,
        }
    }

    /// Heap-allocated storage for `len` entries.
    #[must_use]
    pub fn boxed(len: usize) -> Self {
        let slice: Box<[MaybeUninit<PfnEntry>]> = Box::new_uninit_slice(len.max(1));
        let raw = Box::into_raw(slice).cast::<PfnEntry>();
        Self {
            // SAFETY: `Box::into_raw` never returns null.
            base: unsafe { NonNull::new_unchecked(raw) },
            len,
            owned: true,
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Initialize the entry for `pfn`.
    pub(crate) fn write(&mut self, pfn: Pfn, entry: PfnEntry) {
        assert!(pfn.index() < self.len);
        // SAFETY: in bounds; `write` does not read the old (possibly
        // uninitialized) value.
        unsafe { self.base.add(pfn.index()).write(entry) }
    }

    /// # Safety
    /// `pfn` must have been initialized with [`write`](Self::write).
    #[inline]
    pub(crate) unsafe fn get(&self, pfn: Pfn) -> &PfnEntry {
        debug_assert!(pfn.index() < self.len);
        unsafe { self.base.add(pfn.index()).as_ref() }
    }

    /// # Safety
    /// `pfn` must have been initialized with [`write`](Self::write).
    #[inline]
    pub(crate) unsafe fn get_mut(&mut self, pfn: Pfn) -> &mut PfnEntry {
        debug_assert!(pfn.index() < self.len);
        unsafe { self.base.add(pfn.index()).as_mut() }
    }
}

impl Drop for PfnStorage {
    fn drop(&mut self) {
        if self.owned {
            let slice = core::ptr::slice_from_raw_parts_mut(
                self.base.as_ptr().cast::<MaybeUninit<PfnEntry>>(),
                self.len.max(1),
            );
            // SAFETY: produced by `Box::into_raw` in `boxed` with this length;
            // `MaybeUninit` elements need no drop.
            drop(unsafe { Box::from_raw(slice) });
        }
    }
}
