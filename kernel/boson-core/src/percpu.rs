//! CPU-local storage.
//!
//! [`CpuLocal`] wraps one instance of `T` per possible CPU, indexed by the
//! current CPU id. The id itself comes from a registered accessor — the
//! kernel installs a GS-based reader once per-CPU data is set up; before
//! registration (early boot, host tests) everything resolves to CPU 0.

use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::id::CpuId;

/// Maximum number of supported CPUs.
pub const MAX_CPUS: usize = 32;

/// Signature of the registered current-CPU accessor.
pub type CpuIdFn = fn() -> u32;

fn cpu_zero() -> u32 {
    0
}

static CPU_ID_FN: AtomicPtr<()> = AtomicPtr::new(cpu_zero as *mut ());

/// Number of online CPUs.
static CPU_COUNT: AtomicU32 = AtomicU32::new(1);

/// Registers the current-CPU accessor.
///
/// Called once during boot after the per-CPU segment base is programmed.
pub fn set_cpu_id_fn(f: CpuIdFn) {
    CPU_ID_FN.store(f as *mut (), Ordering::Release);
}

/// Returns the id of the CPU executing this call.
#[must_use]
pub fn current_cpu() -> CpuId {
    let ptr = CPU_ID_FN.load(Ordering::Acquire);
    // SAFETY: CPU_ID_FN only ever holds a valid `CpuIdFn`.
    let f: CpuIdFn = unsafe { core::mem::transmute(ptr) };
    CpuId::new(f())
}

/// Returns the number of online CPUs.
#[must_use]
pub fn cpu_count() -> u32 {
    CPU_COUNT.load(Ordering::Acquire)
}

/// Records the number of online CPUs (boot-time only).
pub fn set_cpu_count(count: u32) {
    debug_assert!(count as usize <= MAX_CPUS);
    CPU_COUNT.store(count, Ordering::Release);
}

/// One instance of `T` per possible CPU.
///
/// Each CPU is expected to touch only its own slot; cross-CPU access via
/// [`CpuLocal::get_for`] is reserved for code that already serializes with
/// the owner (e.g. waking a remote scheduler).
pub struct CpuLocal<T> {
    data: [T; MAX_CPUS],
}

impl<T> CpuLocal<T> {
    /// Wraps a pre-built per-CPU array.
    pub const fn new(data: [T; MAX_CPUS]) -> Self {
        Self { data }
    }

    /// Returns the current CPU's instance.
    pub fn get(&self) -> &T {
        &self.data[current_cpu().as_usize()]
    }

    /// Returns a specific CPU's instance.
    pub fn get_for(&self, cpu: CpuId) -> &T {
        &self.data[cpu.as_usize()]
    }

    /// Iterates over all slots (diagnostics only).
    pub fn iter(&self) -> core::slice::Iter<'_, T> {
        self.data.iter()
    }
}

// SAFETY: Each CPU accesses only its own slot; cross-CPU access requires
// T: Send-compatible synchronization which callers provide.
unsafe impl<T: Send> Send for CpuLocal<T> {}
// SAFETY: As above.
unsafe impl<T: Send> Sync for CpuLocal<T> {}
