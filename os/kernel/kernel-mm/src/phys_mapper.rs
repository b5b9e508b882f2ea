//! # HHDM-based PhysMapper
//!
//! The kernel maps all of physical memory at [`HHDM_BASE`], so any frame is
//! reachable at `HHDM_BASE + pa`. Page tables, the frame database pages and
//! frames being zeroed or copied are all touched through this mapper once
//! the kernel runs on its own page tables.

use kernel_info::memory::{HHDM_BASE, HHDM_SIZE};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for kernels with a higher-half direct map.
///
/// # Safety
/// The direct map must be present and cover every frame passed in.
#[derive(Debug, Copy, Clone, Default)]
pub struct HhdmPhysMapper;

impl HhdmPhysMapper {
    /// Direct-map address of a physical address.
    #[must_use]
    pub const fn virtual_address(pa: PhysicalAddress) -> VirtualAddress {
        debug_assert!(pa.as_u64() < HHDM_SIZE);
        VirtualAddress::new(HHDM_BASE + pa.as_u64())
    }
}

impl PhysMapper for HhdmPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = Self::virtual_address(pa).as_mut_ptr::<T>();
        // SAFETY: caller guarantees the frame is covered by the direct map.
        unsafe { &mut *va }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_map_offset() {
        let pa = PhysicalAddress::new(0x1234_5000);
        assert_eq!(
            HhdmPhysMapper::virtual_address(pa).as_u64(),
            0xFFFF_8880_1234_5000
        );
    }
}
