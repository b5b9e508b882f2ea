//! Saving and restoring the interrupt flag.
//!
//! On hosted builds (tests, tools) interrupts are not ours to control; the
//! primitives do nothing and report interrupts as disabled.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod hw {
    const RFLAGS_IF: u64 = 1 << 9;

    #[inline]
    pub fn disable() {
        // SAFETY: runs in ring 0 on the bare-metal target. Clearing IF only
        // masks maskable interrupts. No `nomem`, so memory accesses are not
        // moved out of the masked region.
        unsafe { core::arch::asm!("cli", options(nostack)) }
    }

    #[inline]
    pub fn enable() {
        // SAFETY: ring 0 as above. Callers only re-enable a state the
        // matching `disable` saved.
        unsafe { core::arch::asm!("sti", options(nostack)) }
    }

    #[inline]
    pub fn enabled() -> bool {
        let rflags: u64;
        // SAFETY: pushes one quadword and pops it straight back into a
        // register. The stack is balanced on exit and no Rust-visible memory
        // is touched.
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) rflags, options(nomem, preserves_flags)) }
        rflags & RFLAGS_IF != 0
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod hw {
    #[inline]
    pub const fn disable() {}

    #[inline]
    pub const fn enable() {}

    #[inline]
    pub const fn enabled() -> bool {
        false
    }
}

/// Whether maskable interrupts are enabled on this CPU.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    hw::enabled()
}

/// Interrupts stay off while the guard lives.
///
/// Guards nest: only the outermost one, which saw interrupts enabled,
/// turns them back on.
pub struct IrqGuard {
    restore: bool,
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let restore = hw::enabled();
        if restore {
            hw::disable();
        }
        Self { restore }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.restore {
            hw::enable();
        }
    }
}
