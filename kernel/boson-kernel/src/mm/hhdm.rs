//! Higher-half direct map.
//!
//! The boot protocol maps all physical memory at a fixed offset; the
//! kernel touches physical pages through it. On the host (unit tests)
//! the offset is zero and addresses are identity-mapped.

use core::sync::atomic::{AtomicU64, Ordering};

static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Records the direct-map offset (boot only).
pub fn init(offset: u64) {
    HHDM_OFFSET.store(offset, Ordering::Release);
}

/// The direct-map offset.
#[must_use]
pub fn offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Acquire)
}

/// Physical address → direct-mapped virtual address.
#[must_use]
pub fn phys_to_virt(phys: u64) -> u64 {
    phys + offset()
}

/// Direct-mapped virtual address → physical address.
#[must_use]
pub fn virt_to_phys(virt: u64) -> u64 {
    virt - offset()
}
