//! Architecture seam for the scheduler.
//!
//! The kernel target provides the real context switch and halt; host
//! builds get stubs so the queueing and priority logic can be tested
//! without switching stacks.

/// Saved architectural context of a suspended task.
///
/// The callee-saved registers live on the task's kernel stack; only the
/// stack pointer itself is stored out-of-line.
#[repr(C)]
#[derive(Debug)]
pub struct Context {
    /// Kernel stack pointer at suspension.
    pub rsp: u64,
}

impl Context {
    /// An empty context; filled by [`init_context`] or the first switch.
    #[must_use]
    pub const fn new() -> Self {
        Self { rsp: 0 }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of callee-saved registers in the switch frame.
const SWITCH_FRAME_REGS: usize = 6;

/// Builds the initial switch frame on a fresh kernel stack.
///
/// The frame mirrors what [`switch_context`] pops: six zeroed callee-saved
/// registers and a return address pointing at `entry`. The first switch
/// into the task therefore "returns" into `entry` with an empty stack.
///
/// # Safety
///
/// `stack_top` must be the 16-byte-aligned top of a writable stack with at
/// least one page of room below it.
pub unsafe fn init_context(ctx: &mut Context, stack_top: *mut u8, entry: extern "C" fn() -> !) {
    let mut sp = stack_top.cast::<u64>();
    // SAFETY: Caller guarantees room below `stack_top`.
    unsafe {
        sp = sp.sub(1);
        sp.write(entry as usize as u64);
        for _ in 0..SWITCH_FRAME_REGS {
            sp = sp.sub(1);
            sp.write(0);
        }
    }
    ctx.rsp = sp as u64;
}

/// Switches from `old` to `new`.
///
/// Pushes the callee-saved registers, stores RSP into `old`, loads RSP
/// from `new`, pops the callee-saved registers, and returns on the new
/// stack. The call appears to return only when some other task switches
/// back to `old`.
///
/// # Safety
///
/// `old` must point at the current task's context and `new` at a context
/// previously filled by [`init_context`] or an earlier switch. Preemption
/// must be disabled around the call.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(old: *mut Context, new: *const Context) {
    core::arch::naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

/// Host stub: scheduling logic tests never actually switch stacks.
#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
pub unsafe extern "C" fn switch_context(_old: *mut Context, _new: *const Context) {
    unreachable!("context switch is not available on the host");
}

/// Enables interrupts and halts until the next one arrives, then disables
/// interrupts again. The idle loop calls this between queue checks.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline]
pub fn halt_until_interrupt() {
    // SAFETY: Executed only from the idle context with a valid IDT.
    unsafe {
        core::arch::asm!("sti", "hlt", "cli", options(nomem, nostack));
    }
}

/// Host stub for the idle halt.
#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
#[inline]
pub fn halt_until_interrupt() {
    core::hint::spin_loop();
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn dummy_entry() -> ! {
        unreachable!()
    }

    #[test]
    fn init_context_builds_switch_frame() {
        let mut stack = vec![0u64; 64];
        let top = unsafe { stack.as_mut_ptr().add(64) };
        let mut ctx = Context::new();
        unsafe { init_context(&mut ctx, top.cast(), dummy_entry) };

        let frame_base = ctx.rsp as *const u64;
        // Six zeroed callee-saved slots, then the entry address.
        for i in 0..SWITCH_FRAME_REGS {
            assert_eq!(unsafe { frame_base.add(i).read() }, 0);
        }
        let ret = unsafe { frame_base.add(SWITCH_FRAME_REGS).read() };
        assert_eq!(ret, dummy_entry as usize as u64);
    }
}
