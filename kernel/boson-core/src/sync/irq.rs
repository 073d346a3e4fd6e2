//! Local interrupt masking.
//!
//! `irq_save_disable` / `irq_restore` bracket short critical sections that
//! must not be re-entered from IRQ context on the same CPU (per-CPU queue
//! pushes, scheduler queue swaps). On the host (unit tests) they are
//! no-ops.

/// Saves the interrupt-enable state and disables interrupts.
///
/// Returns an opaque token for [`irq_restore`].
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline]
#[must_use]
pub fn irq_save_disable() -> u64 {
    let flags: u64;
    // SAFETY: Reading RFLAGS and executing `cli` is always valid in ring 0.
    unsafe {
        core::arch::asm!(
            "pushfq",
            "pop {}",
            "cli",
            out(reg) flags,
            options(nomem),
        );
    }
    flags
}

/// Restores the interrupt-enable state saved by [`irq_save_disable`].
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline]
pub fn irq_restore(flags: u64) {
    // IF is bit 9 of RFLAGS.
    if flags & (1 << 9) != 0 {
        // SAFETY: Re-enabling interrupts restores the saved state.
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
        }
    }
}

/// Host fallback: no interrupt state to save.
#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
#[inline]
#[must_use]
pub fn irq_save_disable() -> u64 {
    0
}

/// Host fallback: nothing to restore.
#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
#[inline]
pub fn irq_restore(_flags: u64) {}
