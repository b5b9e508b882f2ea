//! # Kernel Memory Manager
//!
//! Physical frame accounting, page-table maintenance and the virtual address
//! space bookkeeping of the kernel.
//!
//! ## Pieces
//! - [`pfn`]: one [`PfnEntry`](pfn::PfnEntry) per managed frame, threaded onto
//!   the free, zeroed, standby, modified and related lists.
//! - [`bootstrap`]: the one-time layout and page-table setup that runs before
//!   the frame database exists.
//! - [`area`]: the per-space tree of reserved virtual ranges.
//! - [`rmap`]: the reverse map from a frame to every mapping of it.
//! - [`swap`]: paging files and their slots.
//! - [`balancer`]: consumers, targets and trimming.
//! - [`MemoryManager`]: the service object tying it together, including
//!   page-fault resolution.
//!
//! ## Page life cycle
//!
//! ```text
//!  Free ──zero──▶ Zeroed ──allocate──▶ Active ──page out──▶ Modified
//!   ▲                                    ▲                    │
//!   │                                    └──── soft fault ────┤
//!   └──────────────────── written to paging file ─────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod area;
pub mod balancer;
pub mod bootstrap;
mod config;
mod error;
mod manager;
pub mod pfn;
mod phys_mapper;
pub mod protection;
pub mod rmap;
pub mod space;
pub mod swap;

pub use balancer::{BalanceOutcome, BalancerWaiter, ConsumerStatus, MemoryConsumer, TrimCallback};
pub use config::MmConfig;
pub use error::{BugCheckCode, MmError, bug_check};
pub use manager::{
    FaultContext, FaultResolution, FreedArea, MemoryManager, ProcessorMode, install_system, system,
};
pub use phys_mapper::HhdmPhysMapper;
pub use protection::{AccessKind, Protection};
pub use space::{AddressSpace, AddressSpaceId, SpaceKind};
pub use swap::{PageFileError, PageFileIo, SwapEntry};
