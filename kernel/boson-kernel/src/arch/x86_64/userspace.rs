//! Ring-3 entry.

use super::percpu;

/// User code segment selector (RPL 3).
const USER_CS: u64 = 0x20 | 3;

/// User data segment selector (RPL 3).
const USER_SS: u64 = 0x18 | 3;

/// RFLAGS for fresh user context: IF set, reserved bit 1 set.
const USER_RFLAGS: u64 = 0x202;

/// Enters user mode at `entry` with the given stack. Never returns to
/// the caller; the task re-enters the kernel via syscall or interrupt.
///
/// # Safety
///
/// `entry` and `stack` must lie in the current address space's user
/// mappings, and the per-CPU kernel stack must be set for re-entry.
pub unsafe fn enter_user(entry: u64, stack: u64) -> ! {
    // SAFETY: Caller contract; iretq consumes the five-word frame.
    unsafe {
        core::arch::asm!(
            "swapgs",
            "push {ss}",
            "push {stack}",
            "push {rflags}",
            "push {cs}",
            "push {entry}",
            "iretq",
            ss = in(reg) USER_SS,
            stack = in(reg) stack,
            rflags = in(reg) USER_RFLAGS,
            cs = in(reg) USER_CS,
            entry = in(reg) entry,
            options(noreturn),
        );
    }
}

/// Task entry for a fresh user thread: point the syscall stack at this
/// task's kernel stack, then drop to ring 3 at the loaded image's entry.
pub fn user_task_entry(ctx: usize) {
    let packed = ctx as *const (u64, u64);
    // SAFETY: The spawner leaked a `(entry, stack)` pair for this task.
    let (entry, stack) = unsafe { packed.read() };
    // SAFETY: Reclaim the leaked box.
    drop(unsafe { alloc::boxed::Box::from_raw(packed.cast_mut()) });

    let task = boson_sched::current_task().expect("user entry without task");
    let stack_top = task.kernel_stack_top();
    // SAFETY: The task owns this stack; syscalls re-enter on it.
    unsafe { percpu::set_kernel_rsp(stack_top) };
    // Ring-3 interrupts land on the same stack via the TSS.
    let cpu = boson_core::percpu::current_cpu().as_usize();
    super::gdt::set_interrupt_stack(cpu, stack_top);
    // SAFETY: The image was just loaded into the active address space.
    unsafe { enter_user(entry, stack) };
}
