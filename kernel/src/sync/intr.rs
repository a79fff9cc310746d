//! Interrupt-disable critical sections
//!
//! On a single hart, disabling supervisor interrupts is the only mutual
//! exclusion the kernel needs; every mutation of shared tables happens
//! inside one of these sections. Nesting is handled by saving and
//! restoring the previous `sstatus.SIE` state.

use riscv::register::sstatus;

/// Disable supervisor interrupts, returning whether they were enabled.
pub fn disable() -> bool {
    let was_enabled = sstatus::read().sie();
    // SAFETY: Clearing SIE only defers interrupt delivery; it cannot
    // violate memory safety.
    unsafe {
        sstatus::clear_sie();
    }
    was_enabled
}

/// Restore the interrupt state saved by [`disable`].
pub fn restore(was_enabled: bool) {
    if was_enabled {
        // SAFETY: Re-enabling SIE resumes interrupt delivery; handlers
        // only run between instructions, never mid-critical-section.
        unsafe {
            sstatus::set_sie();
        }
    }
}

/// Enable supervisor interrupts unconditionally.
pub fn enable() {
    // SAFETY: See `restore`.
    unsafe {
        sstatus::set_sie();
    }
}

/// True if supervisor interrupts are currently enabled.
pub fn enabled() -> bool {
    sstatus::read().sie()
}

/// Run `f` with interrupts disabled, restoring the previous state after.
pub fn with_disabled<R>(f: impl FnOnce() -> R) -> R {
    let saved = disable();
    let result = f();
    restore(saved);
    result
}
