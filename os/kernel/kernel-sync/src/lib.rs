//! # Kernel synchronization primitives
//!
//! One lock type, [`Lock`], parameterized over its [`RawLock`]:
//!
//! * [`SpinLock`]: test-and-test-and-set, for short critical sections. Use
//!   [`Lock::lock_irq`] for data that interrupt context touches.
//! * [`TicketMutex`]: FIFO tickets, for owners held across longer
//!   operations where starvation matters.
//!
//! [`SyncOnceCell`] publishes global singletons exactly once, and
//! [`context::current`] names the running CPU (or thread).

#![cfg_attr(not(any(test, doctest, feature = "std")), no_std)]
#![allow(unsafe_code)]

pub mod context;
pub mod irq;
mod lock;
mod once;
mod raw;

pub use irq::IrqGuard;
pub use lock::{IrqLockGuard, Lock, LockGuard};
pub use once::SyncOnceCell;
pub use raw::{RawLock, RawSpin, RawTicket};

pub type SpinLock<T> = Lock<T, RawSpin>;
pub type SpinLockGuard<'a, T> = LockGuard<'a, T, RawSpin>;
pub type IrqSpinLockGuard<'a, T> = IrqLockGuard<'a, T, RawSpin>;

pub type TicketMutex<T> = Lock<T, RawTicket>;
pub type TicketGuard<'a, T> = LockGuard<'a, T, RawTicket>;
