use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// Largest swap locator a not-present entry can carry (bits 12..=63).
pub const MAX_SWAP_LOCATOR: u64 = (1 << 52) - 1;

/// Bit position of the software `swap` flag.
const SWAP_BIT: u64 = 1 << 9;

/// Represents a single 64-bit x86-64 page table entry in its raw bitfield form.
///
/// The layout is the common superset of all four levels. Bits 9..=11 are
/// ignored by hardware and carry memory-manager state:
///
/// | Bits  | Name            | Meaning |
/// |-------|-----------------|---------|
/// | 0     | `P`             | Present |
/// | 1     | `RW`            | Writable |
/// | 2     | `US`            | User accessible |
/// | 3     | `PWT`           | Write-through |
/// | 4     | `PCD`           | Cache disabled |
/// | 5     | `A`             | Accessed |
/// | 6     | `D`             | Dirty (leaf only) |
/// | 7     | `PS`            | Large page |
/// | 8     | `G`             | Global (leaf only) |
/// | 9     | `swap`          | Not present, bits 12..=63 hold a swap locator |
/// | 10    | `copy_on_write` | Write faults copy the frame |
/// | 11    | `disabled`      | Not present but still owns its frame (no access) |
/// | 12–51 | `addr`          | Physical frame bits [51:12] |
/// | 59–62 | `PKU`           | Protection key |
/// | 63    | `NX`            | Execute disable |
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::{PageTableEntry, PteState};
/// let e = PageTableEntry::new_leaf(PhysicalAddress::new(0x12_3000)).with_writable(true);
/// assert_eq!(e.state(), PteState::Present);
/// assert_eq!(e.frame_address().as_u64(), 0x12_3000);
///
/// let s = PageTableEntry::new_swap(42);
/// assert_eq!(s.state(), PteState::Swapped(42));
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    pub present: bool,
    pub writable: bool,
    pub user_access: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub large_page: bool,
    pub global_translation: bool,

    /// Software: not-present entry that refers to backing store.
    pub swap: bool,

    /// Software: writes must be resolved by copying the frame.
    pub copy_on_write: bool,

    /// Software: mapping suspended (no access) but the frame stays assigned.
    pub disabled: bool,

    #[bits(40)]
    frame_bits: u64,

    #[bits(7)]
    __: u8,

    #[bits(4)]
    pub protection_key: u8,

    pub no_execute: bool,
}

/// Coarse interpretation of an entry as the memory manager sees it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PteState {
    /// Nothing mapped, nothing reserved.
    Empty,
    /// Valid translation.
    Present,
    /// Paged out; the value is the swap locator.
    Swapped(u64),
    /// Owns a frame, but accesses fault.
    Disabled,
}

impl PageTableEntry {
    /// Empty entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    /// Present, writable link to a next-level table.
    #[inline]
    #[must_use]
    pub const fn new_table(table: PhysicalAddress, user: bool) -> Self {
        Self::new_leaf(table).with_writable(true).with_user_access(user)
    }

    /// Present read-only leaf for `frame`; callers add permissions.
    #[inline]
    #[must_use]
    pub const fn new_leaf(frame: PhysicalAddress) -> Self {
        Self::new()
            .with_present(true)
            .with_frame_bits(frame.frame_number())
    }

    /// Not-present entry referring to backing store.
    ///
    /// The locator must not exceed [`MAX_SWAP_LOCATOR`].
    #[inline]
    #[must_use]
    pub const fn new_swap(locator: u64) -> Self {
        debug_assert!(locator <= MAX_SWAP_LOCATOR);
        Self::from_bits((locator << 12) | SWAP_BIT)
    }

    #[inline]
    #[must_use]
    pub const fn frame_address(&self) -> PhysicalAddress {
        PhysicalAddress::from_frame_number(self.frame_bits())
    }

    #[inline]
    pub fn set_frame_address(&mut self, frame: PhysicalAddress) {
        self.set_frame_bits(frame.frame_number());
    }

    /// The swap locator, if this is a swap entry.
    #[inline]
    #[must_use]
    pub const fn swap_locator(&self) -> Option<u64> {
        if !self.present() && self.swap() {
            Some(self.into_bits() >> 12)
        } else {
            None
        }
    }

    #[must_use]
    pub const fn state(&self) -> PteState {
        if self.present() {
            PteState::Present
        } else if let Some(locator) = self.swap_locator() {
            PteState::Swapped(locator)
        } else if self.disabled() {
            PteState::Disabled
        } else {
            PteState::Empty
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.into_bits() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_bits_live_in_ignored_positions() {
        let e = PageTableEntry::new()
            .with_swap(true)
            .with_copy_on_write(true)
            .with_disabled(true);
        assert_eq!(e.into_bits(), 0b1110_0000_0000);
    }

    #[test]
    fn swap_locator_survives_full_width() {
        let e = PageTableEntry::new_swap(MAX_SWAP_LOCATOR);
        assert!(!e.present());
        assert_eq!(e.swap_locator(), Some(MAX_SWAP_LOCATOR));
    }

    #[test]
    fn disabled_keeps_frame() {
        let mut e = PageTableEntry::new_leaf(PhysicalAddress::from_frame_number(9))
            .with_writable(true);
        e.set_present(false);
        e.set_disabled(true);
        assert_eq!(e.state(), PteState::Disabled);
        assert_eq!(e.frame_address().frame_number(), 9);
        assert!(e.writable());
    }

    #[test]
    fn present_wins_over_software_bits() {
        let e = PageTableEntry::new_leaf(PhysicalAddress::from_frame_number(1)).with_swap(true);
        assert_eq!(e.state(), PteState::Present);
        assert_eq!(e.swap_locator(), None);
    }
}
