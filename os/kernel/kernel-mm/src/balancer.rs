//! # Memory consumers and the balancer
//!
//! Every allocated frame is charged to one [`MemoryConsumer`]. Consumers that
//! can give memory back register a [`TrimCallback`]; when free + zeroed +
//! standby pages drop below the low-memory threshold, the balancer asks the
//! consumers furthest over their target first.
//!
//! ```text
//!   used ─────────────┬──────────────────────────────
//!                     │ over target: trimmed first
//!   target ───────────┼──────────────────────────────
//!                     │ at or below target: trimmed last
//! ```

use crate::MemoryManager;
use alloc::sync::Arc;
use core::fmt;
use kernel_vmem::PhysMapper;

/// Who a frame is charged to.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum MemoryConsumer {
    /// File and section cache pages.
    Cache,
    /// Pages mapped into user address spaces.
    User,
    /// Kernel pool, page tables, stacks.
    System,
}

impl MemoryConsumer {
    pub const COUNT: usize = 3;
    pub const ALL: [Self; Self::COUNT] = [Self::Cache, Self::User, Self::System];

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Cache => 0,
            Self::User => 1,
            Self::System => 2,
        }
    }
}

impl fmt::Display for MemoryConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cache => "cache",
            Self::User => "user",
            Self::System => "system",
        })
    }
}

/// Asked to release up to `pages` frames; returns how many it released (or
/// queued for writing).
pub type TrimCallback<M> = Arc<dyn Fn(&MemoryManager<M>, usize) -> usize + Send + Sync>;

/// Registration slot of one consumer.
pub(crate) struct ConsumerSlot<M: PhysMapper> {
    pub(crate) target: usize,
    pub(crate) trim: Option<TrimCallback<M>>,
}

impl<M: PhysMapper> ConsumerSlot<M> {
    pub(crate) const fn new() -> Self {
        Self {
            target: usize::MAX,
            trim: None,
        }
    }
}

/// Result of one balancing pass.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BalanceOutcome {
    /// Enough pages were available before or after trimming.
    Satisfied { trimmed: usize },
    /// Every consumer was asked and memory is still short.
    LowMemory { trimmed: usize },
}

impl BalanceOutcome {
    #[must_use]
    pub const fn is_satisfied(self) -> bool {
        matches!(self, Self::Satisfied { .. })
    }

    /// Pages the pass got back from consumers.
    #[must_use]
    pub const fn trimmed(self) -> usize {
        match self {
            Self::Satisfied { trimmed } | Self::LowMemory { trimmed } => trimmed,
        }
    }
}

/// Point-in-time view of one consumer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ConsumerStatus {
    pub consumer: MemoryConsumer,
    pub used: usize,
    pub target: usize,
    pub trimmable: bool,
}

impl ConsumerStatus {
    /// Pages above target; negative when under it.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn excess(&self) -> i64 {
        if self.target == usize::MAX {
            i64::MIN
        } else {
            self.used as i64 - self.target as i64
        }
    }
}

/// Blocking primitive the balancer thread sleeps on between passes.
///
/// Implemented by the scheduler; [`MemoryManager::wake_balancer`] signals it.
pub trait BalancerWaiter {
    /// Sleep until signaled or a scheduler-defined timeout passes.
    fn wait(&self);
    fn signal(&self);
}
