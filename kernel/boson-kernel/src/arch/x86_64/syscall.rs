//! SYSCALL/SYSRET plumbing.
//!
//! Programs the STAR/LSTAR/SFMASK MSRs and provides the naked entry
//! stub: swapgs, stack switch through the per-CPU block, argument
//! shuffle into the System V call convention, dispatch, sysret.

use boson_core::kdebug;

use super::instructions::{rdmsr, wrmsr};

/// `IA32_EFER`.
const MSR_EFER: u32 = 0xC000_0080;

/// `EFER.SCE` — syscall enable.
const EFER_SCE: u64 = 1;

/// `IA32_STAR` — segment bases for syscall/sysret.
const MSR_STAR: u32 = 0xC000_0081;

/// `IA32_LSTAR` — 64-bit syscall entry point.
const MSR_LSTAR: u32 = 0xC000_0082;

/// `IA32_SFMASK` — RFLAGS bits cleared on entry (IF and DF).
const MSR_SFMASK: u32 = 0xC000_0084;

/// RFLAGS mask: clear IF (bit 9) and DF (bit 10) on entry.
const SFMASK_VALUE: u64 = 0x600;

/// Initializes the SYSCALL/SYSRET mechanism on this CPU.
///
/// # Safety
///
/// GDT segments must be laid out kernel-code at 0x08 and the sysret base
/// at 0x10; the per-CPU GS base must already be programmed.
pub unsafe fn init() {
    // SAFETY: Programming architecturally defined MSRs per the caller's
    // segment-layout contract.
    unsafe {
        wrmsr(MSR_EFER, rdmsr(MSR_EFER) | EFER_SCE);
        wrmsr(MSR_STAR, (0x08u64 << 32) | (0x10u64 << 48));
        wrmsr(MSR_LSTAR, syscall_entry as usize as u64);
        wrmsr(MSR_SFMASK, SFMASK_VALUE);
    }
    kdebug!("syscall entry installed");
}

/// Rust-side landing pad: registers already follow the C convention.
extern "C" fn syscall_dispatch(
    nr: usize,
    a0: usize,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
    a5: usize,
) -> isize {
    crate::syscall::dispatch(nr, a0, a1, a2, a3, a4, a5)
}

/// SYSCALL entry stub.
///
/// On entry: RCX = user RIP, R11 = user RFLAGS, RAX = syscall number,
/// args in RDI RSI RDX R10 R8 R9. Interrupts are masked by SFMASK.
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_entry() {
    core::arch::naked_asm!(
        "swapgs",
        // Park the user stack, adopt the kernel stack (PerCpu offsets
        // 8 = kernel_rsp, 16 = user_rsp).
        "mov gs:[16], rsp",
        "mov rsp, gs:[8]",
        // Save user return state and callee-clobbered pieces.
        "push rcx", // user RIP
        "push r11", // user RFLAGS
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // C ABI shuffle: nr, a0..a5. The 16-byte frame keeps the call
        // site aligned; a5 rides the stack as the seventh argument.
        // rax=nr rdi=a0 rsi=a1 rdx=a2 r10=a3 r8=a4 r9=a5
        "sub rsp, 16",
        "mov [rsp], r9",  // a5 → stack (7th argument)
        "mov r9, r8",     // a4
        "mov r8, r10",    // a3
        "mov rcx, rdx",   // a2
        "mov rdx, rsi",   // a1
        "mov rsi, rdi",   // a0
        "mov rdi, rax",   // nr
        "call {dispatch}",
        "add rsp, 16",    // drop a5 and padding
        // Restore and return to user.
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "pop r11", // user RFLAGS
        "pop rcx", // user RIP
        "mov rsp, gs:[16]",
        "swapgs",
        "sysretq",
        dispatch = sym syscall_dispatch,
    );
}
