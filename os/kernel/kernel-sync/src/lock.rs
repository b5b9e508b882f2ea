use crate::irq::IrqGuard;
use crate::raw::RawLock;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

/// Data guarded by a raw lock `R`.
pub struct Lock<T, R: RawLock> {
    raw: R,
    value: UnsafeCell<T>,
}

// SAFETY: the raw lock serializes all access to `value`.
unsafe impl<T: Send, R: RawLock + Sync> Sync for Lock<T, R> {}
unsafe impl<T: Send, R: RawLock + Send> Send for Lock<T, R> {}

impl<T, R: RawLock> Lock<T, R> {
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self {
            raw: R::UNLOCKED,
            value: UnsafeCell::new(value),
        }
    }

    #[inline]
    pub fn lock(&self) -> LockGuard<'_, T, R> {
        self.raw.lock();
        LockGuard { lock: self }
    }

    #[inline]
    #[must_use]
    pub fn try_lock(&self) -> Option<LockGuard<'_, T, R>> {
        if self.raw.try_lock() {
            Some(LockGuard { lock: self })
        } else {
            None
        }
    }

    /// Disable interrupts, then acquire.
    ///
    /// The guard releases the lock before it restores the interrupt state.
    #[inline]
    pub fn lock_irq(&self) -> IrqLockGuard<'_, T, R> {
        let irq = IrqGuard::new();
        IrqLockGuard {
            guard: self.lock(),
            _irq: irq,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Default, R: RawLock> Default for Lock<T, R> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub struct LockGuard<'a, T, R: RawLock> {
    lock: &'a Lock<T, R>,
}

impl<T, R: RawLock> Deref for LockGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T, R: RawLock> DerefMut for LockGuard<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T, R: RawLock> Drop for LockGuard<'_, T, R> {
    fn drop(&mut self) {
        // SAFETY: constructed only after a successful acquire.
        unsafe { self.lock.raw.unlock() }
    }
}

/// Guard from [`Lock::lock_irq`].
///
/// Fields drop in declaration order: lock first, interrupts after.
pub struct IrqLockGuard<'a, T, R: RawLock> {
    guard: LockGuard<'a, T, R>,
    _irq: IrqGuard,
}

impl<T, R: RawLock> Deref for IrqLockGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T, R: RawLock> DerefMut for IrqLockGuard<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
