//! # Paging files
//!
//! A [`SwapEntry`] names one page-sized slot in one paging file. The memory
//! manager owns slot allocation (a bitmap per file); the actual reads and
//! writes go through the [`PageFileIo`] each file was registered with.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use kernel_vmem::MAX_SWAP_LOCATOR;
use log::{debug, info};

/// Upper bound on registered paging files.
pub const MAX_PAGING_FILES: usize = 16;

/// Slots a single paging file can address.
pub const MAX_SLOTS_PER_FILE: u64 = 1 << 48;

/// Contents of one page.
pub type Page = [u8; 4096];

/// Paging file index and slot, packed into the 52-bit swap locator a
/// not-present PTE can hold.
#[bitfield(u64)]
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapEntry {
    #[bits(4)]
    pub file: u8,
    #[bits(48)]
    pub slot: u64,
    #[bits(12)]
    __: u16,
}

const _: () = assert!(MAX_PAGING_FILES <= 1 << 4);

impl SwapEntry {
    #[inline]
    #[must_use]
    pub const fn from_parts(file: u8, slot: u64) -> Self {
        Self::new().with_file(file).with_slot(slot)
    }

    /// The value stored in a swap PTE.
    #[inline]
    #[must_use]
    pub const fn locator(self) -> u64 {
        self.into_bits()
    }

    #[inline]
    #[must_use]
    pub const fn from_locator(locator: u64) -> Self {
        debug_assert!(locator <= MAX_SWAP_LOCATOR);
        Self::from_bits(locator)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PageFileError {
    #[error("paging file I/O failed for locator {0:#x}")]
    Io(u64),
    #[error("too many paging files")]
    TooManyFiles,
    #[error("paging file has no slots")]
    EmptyFile,
    #[error("locator {0:#x} does not name a paging file slot")]
    InvalidLocator(u64),
}

/// Backend that stores page contents for one paging file.
pub trait PageFileIo: Send + Sync {
    /// # Errors
    /// [`PageFileError::Io`] if the device failed; the caller retries.
    fn read_page(&self, entry: SwapEntry, page: &mut Page) -> Result<(), PageFileError>;

    /// # Errors
    /// [`PageFileError::Io`] if the device failed; the caller retries.
    fn write_page(&self, entry: SwapEntry, page: &Page) -> Result<(), PageFileError>;
}

struct PagingFile {
    io: Arc<dyn PageFileIo>,
    bitmap: Vec<u64>,
    slots: u64,
    used: u64,
    hint: u64,
    /// Slots are only handed out once the file is online.
    online: bool,
}

impl PagingFile {
    #[allow(clippy::cast_possible_truncation)]
    fn allocate(&mut self) -> Option<u64> {
        if !self.online || self.used == self.slots {
            return None;
        }
        let words = self.bitmap.len();
        let start = (self.hint / 64) as usize;
        for step in 0..words {
            let word_index = (start + step) % words;
            let word = self.bitmap[word_index];
            if word == u64::MAX {
                continue;
            }
            let bit = u64::from((!word).trailing_zeros());
            let slot = word_index as u64 * 64 + bit;
            if slot >= self.slots {
                continue;
            }
            self.bitmap[word_index] |= 1 << bit;
            self.used += 1;
            self.hint = slot + 1;
            return Some(slot);
        }
        None
    }

    #[allow(clippy::cast_possible_truncation)]
    fn free(&mut self, slot: u64) -> bool {
        if slot >= self.slots {
            return false;
        }
        let word = &mut self.bitmap[(slot / 64) as usize];
        let mask = 1 << (slot % 64);
        if *word & mask == 0 {
            return false;
        }
        *word &= !mask;
        self.used -= 1;
        self.hint = self.hint.min(slot);
        true
    }
}

/// All registered paging files.
#[derive(Default)]
pub struct PagingFiles {
    files: Vec<PagingFile>,
}

impl PagingFiles {
    #[must_use]
    pub const fn new() -> Self {
        Self { files: Vec::new() }
    }

    /// Add a paging file with `slots` page slots, clamped to
    /// [`MAX_SLOTS_PER_FILE`]. The file hands out no slots until
    /// [`bring_online`](Self::bring_online).
    ///
    /// # Errors
    /// [`PageFileError::TooManyFiles`] past [`MAX_PAGING_FILES`];
    /// [`PageFileError::EmptyFile`] for zero slots.
    #[allow(clippy::cast_possible_truncation)]
    pub fn register(&mut self, slots: u64, io: Arc<dyn PageFileIo>) -> Result<u8, PageFileError> {
        if self.files.len() >= MAX_PAGING_FILES {
            return Err(PageFileError::TooManyFiles);
        }
        if slots == 0 {
            return Err(PageFileError::EmptyFile);
        }
        let slots = slots.min(MAX_SLOTS_PER_FILE);
        let index = self.files.len() as u8;
        self.files.push(PagingFile {
            io,
            bitmap: vec![0; slots.div_ceil(64) as usize],
            slots,
            used: 0,
            hint: 0,
            online: false,
        });
        info!("paging file {index}: {slots} slots");
        Ok(index)
    }

    /// Start allocating from file `index`.
    pub fn bring_online(&mut self, index: u8) {
        if let Some(file) = self.files.get_mut(usize::from(index)) {
            file.online = true;
        }
    }

    /// Slot count of file `index`.
    #[must_use]
    pub fn slots(&self, index: u8) -> Option<u64> {
        self.files.get(usize::from(index)).map(|file| file.slots)
    }

    /// Claim a free slot from the first online file that has one.
    #[allow(clippy::cast_possible_truncation)]
    pub fn allocate(&mut self) -> Option<SwapEntry> {
        self.files.iter_mut().enumerate().find_map(|(index, file)| {
            file.allocate()
                .map(|slot| SwapEntry::from_parts(index as u8, slot))
        })
    }

    /// Return a slot.
    ///
    /// # Errors
    /// [`PageFileError::InvalidLocator`] if the slot is not allocated.
    pub fn free(&mut self, entry: SwapEntry) -> Result<(), PageFileError> {
        let freed = self
            .files
            .get_mut(usize::from(entry.file()))
            .is_some_and(|file| file.free(entry.slot()));
        if freed {
            debug!("swap slot {:#x} released", entry.locator());
            Ok(())
        } else {
            Err(PageFileError::InvalidLocator(entry.locator()))
        }
    }

    /// I/O backend for the file `entry` lives in.
    #[must_use]
    pub fn io(&self, entry: SwapEntry) -> Option<Arc<dyn PageFileIo>> {
        self.files
            .get(usize::from(entry.file()))
            .map(|file| Arc::clone(&file.io))
    }

    #[must_use]
    pub fn is_allocated(&self, entry: SwapEntry) -> bool {
        self.files
            .get(usize::from(entry.file()))
            .is_some_and(|file| {
                let slot = entry.slot();
                slot < file.slots && file.bitmap[(slot / 64) as usize] & (1 << (slot % 64)) != 0
            })
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Slots in use across all files.
    #[must_use]
    pub fn used_slots(&self) -> u64 {
        self.files.iter().map(|f| f.used).sum()
    }

    #[must_use]
    pub fn total_slots(&self) -> u64 {
        self.files.iter().map(|f| f.slots).sum()
    }
}
