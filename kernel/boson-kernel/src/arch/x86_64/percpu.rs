//! GS-based per-CPU block.
//!
//! Each CPU's GS base points at its own [`PerCpu`]; `GS:[0]` is a
//! self-pointer so [`current_cpu_id`] needs no global lookup. The
//! accessor is registered with `boson-core` so every crate's
//! [`CpuLocal`](boson_core::percpu::CpuLocal) indexes correctly.

use core::sync::atomic::{AtomicU32, Ordering};

use boson_core::percpu::MAX_CPUS;

use super::instructions::{MSR_GS_BASE, MSR_KERNEL_GS_BASE, wrmsr};

/// Per-CPU data reachable through GS.
///
/// `#[repr(C)]` keeps the assembly-visible offsets fixed:
/// - offset 0: `self_ptr` (the `GS:[0]` self-pointer)
/// - offset 8: `kernel_rsp` (syscall entry stack switch)
/// - offset 16: `user_rsp` (saved across syscalls)
/// - offset 24: `cpu_id`
#[repr(C)]
pub struct PerCpu {
    /// Self-pointer (offset 0).
    pub self_ptr: u64,
    /// Kernel stack for syscall entry (offset 8).
    pub kernel_rsp: u64,
    /// User stack parked during a syscall (offset 16).
    pub user_rsp: u64,
    /// Logical CPU id (offset 24).
    pub cpu_id: AtomicU32,
}

impl PerCpu {
    const fn new() -> Self {
        Self {
            self_ptr: 0,
            kernel_rsp: 0,
            user_rsp: 0,
            cpu_id: AtomicU32::new(0),
        }
    }
}

/// Static per-CPU blocks, indexed by logical id.
static PERCPU: [PerCpu; MAX_CPUS] = [const { PerCpu::new() }; MAX_CPUS];

/// Logical id of the next CPU to come up.
static NEXT_CPU: AtomicU32 = AtomicU32::new(0);

/// The current CPU's block, via the GS self-pointer.
#[must_use]
pub fn current_cpu() -> &'static PerCpu {
    // SAFETY: GS:[0] was set to the block's own address in init_gs_base
    // before any caller can run.
    unsafe {
        let ptr: u64;
        core::arch::asm!("mov {}, gs:[0]", out(reg) ptr, options(readonly, nostack));
        &*(ptr as *const PerCpu)
    }
}

fn current_cpu_id() -> u32 {
    current_cpu().cpu_id.load(Ordering::Relaxed)
}

/// Claims the next logical CPU id and programs this CPU's GS bases.
///
/// Also registers the CPU-id accessor with `boson-core` (idempotent).
///
/// # Safety
///
/// Must run once per CPU, before interrupts or syscalls are possible.
pub unsafe fn init_gs_base() {
    let id = NEXT_CPU.fetch_add(1, Ordering::AcqRel);
    assert!((id as usize) < MAX_CPUS, "more CPUs than MAX_CPUS");
    let block = &PERCPU[id as usize];
    block.cpu_id.store(id, Ordering::Relaxed);

    let addr = block as *const PerCpu as u64;
    // SAFETY: The block is a static; writing both GS bases to it makes
    // swapgs a no-op in ring 0, correct until user mode exists. The
    // self_ptr store races nothing — this CPU is the only writer.
    unsafe {
        core::ptr::addr_of!(block.self_ptr)
            .cast_mut()
            .write_volatile(addr);
        wrmsr(MSR_GS_BASE, addr);
        wrmsr(MSR_KERNEL_GS_BASE, addr);
    }

    boson_core::percpu::set_cpu_id_fn(current_cpu_id);
}

/// Points the syscall entry stack at the top of a guarded kernel stack.
///
/// # Safety
///
/// `rsp` must be the top of a mapped stack usable for syscall entry.
pub unsafe fn set_kernel_rsp(rsp: u64) {
    let block = current_cpu();
    // SAFETY: Only this CPU writes its own block.
    unsafe {
        core::ptr::addr_of!(block.kernel_rsp)
            .cast_mut()
            .write_volatile(rsp);
    }
}
