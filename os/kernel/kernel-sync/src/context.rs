//! Who is running right now.
//!
//! [`current`] tells re-entry apart from contention: a lock owner that
//! records its context can recognise itself coming back. On the bare-metal
//! target the context is the CPU, on hosted builds with `std` it is the
//! thread, and without either everything runs in one context.

/// Never returned by [`current`]; use it for "no owner".
pub const NO_CONTEXT: usize = 0;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[inline]
#[must_use]
pub fn current() -> usize {
    // SAFETY: CPUID leaf 1 exists on every x86_64 processor.
    #[allow(unused_unsafe)]
    let leaf = unsafe { core::arch::x86_64::__cpuid(1) };
    // Initial APIC ID, moved off zero.
    (leaf.ebx >> 24) as usize + 1
}

#[cfg(all(feature = "std", not(all(target_arch = "x86_64", target_os = "none"))))]
#[inline]
#[must_use]
pub fn current() -> usize {
    std::thread_local! {
        static MARKER: u8 = const { 0 };
    }
    // A live thread's locals have a unique, non-null address.
    MARKER.with(|marker| core::ptr::from_ref(marker) as usize)
}

#[cfg(not(any(feature = "std", all(target_arch = "x86_64", target_os = "none"))))]
#[inline]
#[must_use]
pub const fn current() -> usize {
    1
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn threads_get_their_own_context() {
        let here = current();
        assert_ne!(here, NO_CONTEXT);
        assert_eq!(current(), here);
        let there = std::thread::spawn(current).join().unwrap();
        assert_ne!(there, here);
    }
}
