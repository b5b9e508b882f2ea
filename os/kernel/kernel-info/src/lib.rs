//! # Kernel Configuration and Boot Interface
//!
//! Shared constants and boot-time contracts consumed by the memory manager.
//!
//! ## Boot Information ([`boot`])
//! The loader hands the kernel an ordered list of physical memory descriptors.
//! Each descriptor names a run of page frames and what the loader used it for;
//! the memory manager decides from the type whether the run is managed RAM,
//! scratch space it may reclaim, or firmware memory it must never touch.
//!
//! ## Memory Layout ([`memory`])
//! Fixed virtual address space geometry (user range, direct map, system
//! regions) as compile-time constants, checked by `const` assertions.
//!
//! ```text
//! 0x0000_0000_0001_0000  lowest user address
//! 0x0000_07FF_FFFE_FFFF  highest user address
//! 0xFFFF_8000_0000_0000  system range start
//! 0xFFFF_8880_0000_0000  HHDM (direct map of physical memory)
//! 0xFFFF_F700_0000_0000  hyperspace
//! 0xFFFF_F8A0_0000_0000  paged pool
//! 0xFFFF_F900_0000_0000  system view / session space
//! 0xFFFF_FAA0_0000_0000  non-paged system region (system PTEs)
//!                        PFN database, non-paged pool
//! 0xFFFF_FAE0_0000_0000  non-paged pool end
//! 0xFFFF_FFFF_8000_0000  kernel image
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
