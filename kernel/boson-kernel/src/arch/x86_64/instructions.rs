//! Privileged instruction wrappers.

/// Enables interrupts.
///
/// # Safety
///
/// The IDT must be loaded and handlers able to run.
#[inline]
pub unsafe fn enable_interrupts() {
    // SAFETY: Caller contract.
    unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) };
}

/// Disables interrupts.
#[inline]
pub fn disable_interrupts() {
    // SAFETY: Masking interrupts in ring 0 is always permitted.
    unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) };
}

/// Halts until the next interrupt.
#[inline]
pub fn hlt() {
    // SAFETY: `hlt` in ring 0 just waits for an interrupt.
    unsafe { core::arch::asm!("hlt", options(nomem, nostack, preserves_flags)) };
}

/// Reads the faulting address after a page fault.
#[inline]
#[must_use]
pub fn read_cr2() -> u64 {
    let value: u64;
    // SAFETY: CR2 is readable in ring 0.
    unsafe { core::arch::asm!("mov {}, cr2", out(reg) value, options(nomem, nostack)) };
    value
}

/// Reads the current page-table root.
#[inline]
#[must_use]
pub fn read_cr3() -> u64 {
    let value: u64;
    // SAFETY: CR3 is readable in ring 0.
    unsafe { core::arch::asm!("mov {}, cr3", out(reg) value, options(nomem, nostack)) };
    value
}

/// Loads a page-table root.
///
/// # Safety
///
/// `phys` must point at a valid PML4 mapping the executing code.
#[inline]
pub unsafe fn write_cr3(phys: u64) {
    // SAFETY: Caller contract.
    unsafe { core::arch::asm!("mov cr3, {}", in(reg) phys, options(nostack)) };
}

/// Reads a model-specific register.
///
/// # Safety
///
/// `msr` must be a valid MSR number.
#[inline]
#[must_use]
pub unsafe fn rdmsr(msr: u32) -> u64 {
    let (lo, hi): (u32, u32);
    // SAFETY: Caller contract.
    unsafe {
        core::arch::asm!(
            "rdmsr",
            in("ecx") msr,
            out("eax") lo,
            out("edx") hi,
            options(nomem, nostack),
        );
    }
    (u64::from(hi) << 32) | u64::from(lo)
}

/// Writes a model-specific register.
///
/// # Safety
///
/// `msr` must be valid and the value architecturally acceptable.
#[inline]
pub unsafe fn wrmsr(msr: u32, value: u64) {
    let lo = value as u32;
    let hi = (value >> 32) as u32;
    // SAFETY: Caller contract.
    unsafe {
        core::arch::asm!(
            "wrmsr",
            in("ecx") msr,
            in("eax") lo,
            in("edx") hi,
            options(nomem, nostack),
        );
    }
}

/// `IA32_FS_BASE`.
pub const MSR_FS_BASE: u32 = 0xC000_0100;

/// `IA32_GS_BASE`.
pub const MSR_GS_BASE: u32 = 0xC000_0101;

/// `IA32_KERNEL_GS_BASE`.
pub const MSR_KERNEL_GS_BASE: u32 = 0xC000_0102;

/// Sets the user FS segment base (TLS).
///
/// # Safety
///
/// Only meaningful for the currently running user thread.
#[inline]
pub unsafe fn write_fs_base(base: u64) {
    // SAFETY: Caller contract.
    unsafe { wrmsr(MSR_FS_BASE, base) };
}
