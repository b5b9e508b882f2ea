use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Bare mutual exclusion without data.
///
/// # Safety
/// `lock` and a successful `try_lock` must exclude every other holder until
/// `unlock`, with acquire/release ordering around the critical section.
pub unsafe trait RawLock {
    /// The unlocked state.
    const UNLOCKED: Self;

    fn lock(&self);
    fn try_lock(&self) -> bool;
    /// Snapshot for assertions; may be stale when read.
    fn is_locked(&self) -> bool;

    /// # Safety
    /// The caller must hold the lock.
    unsafe fn unlock(&self);
}

/// Unfair test-and-test-and-set lock.
pub struct RawSpin {
    held: AtomicBool,
}

unsafe impl RawLock for RawSpin {
    const UNLOCKED: Self = Self {
        held: AtomicBool::new(false),
    };

    #[inline]
    fn lock(&self) {
        while self
            .held
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.held.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.held.store(false, Ordering::Release);
    }
}

/// FIFO ticket lock. A waiter draws from `next` and spins until `serving`
/// reaches its number.
pub struct RawTicket {
    next: AtomicU32,
    serving: AtomicU32,
}

unsafe impl RawLock for RawTicket {
    const UNLOCKED: Self = Self {
        next: AtomicU32::new(0),
        serving: AtomicU32::new(0),
    };

    #[inline]
    fn lock(&self) {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        while self.serving.load(Ordering::Acquire) != ticket {
            spin_loop();
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        // Draw a ticket only if it would be served at once.
        let serving = self.serving.load(Ordering::Relaxed);
        self.next
            .compare_exchange(serving, serving.wrapping_add(1), Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.next.load(Ordering::Relaxed) != self.serving.load(Ordering::Relaxed)
    }

    #[inline]
    unsafe fn unlock(&self) {
        // Only the holder writes `serving`.
        let current = self.serving.load(Ordering::Relaxed);
        self.serving.store(current.wrapping_add(1), Ordering::Release);
    }
}
