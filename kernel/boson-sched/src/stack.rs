//! Kernel stacks.
//!
//! Every task owns a fixed-size kernel stack allocated as one page-rank
//! region: the lowest page is a guard gap that is never handed to the
//! stack proper, so an overflow walks into memory the kernel can unmap
//! (or at minimum poison) instead of silently corrupting a neighbouring
//! allocation. Stacks never share a page with anything else.

use core::ptr::NonNull;

use boson_core::Result;
use boson_mm::frames;

/// Usable kernel stack size in bytes (two pages).
pub const KERNEL_STACK_SIZE: usize = 2 * frames::PAGE_SIZE;

/// Pages reserved below the stack as a guard gap.
const GUARD_PAGES: usize = 1;

/// Page rank covering guard + stack, rounded up to a power of two.
const STACK_RANK: u32 = {
    let needed = KERNEL_STACK_SIZE / frames::PAGE_SIZE + GUARD_PAGES;
    let mut rank = 0;
    while (1 << rank) < needed {
        rank += 1;
    }
    rank
};

/// A guarded kernel stack.
pub struct KernelStack {
    base: NonNull<u8>,
}

// SAFETY: The stack region is exclusively owned; the owning task moves
// between CPUs only while suspended.
unsafe impl Send for KernelStack {}
// SAFETY: As above; shared access never touches the stack memory.
unsafe impl Sync for KernelStack {}

impl KernelStack {
    /// Allocates a stack with its guard gap.
    ///
    /// # Errors
    ///
    /// Returns `NoMemory` when page frames are exhausted.
    pub fn alloc() -> Result<Self> {
        let base = frames::alloc_pages(STACK_RANK)?;
        Ok(Self { base })
    }

    /// First usable byte above the guard gap.
    #[must_use]
    pub fn bottom(&self) -> NonNull<u8> {
        // SAFETY: The guard pages are part of the same allocation.
        NonNull::new(unsafe { self.base.as_ptr().add(GUARD_PAGES * frames::PAGE_SIZE) })
            .expect("stack base is non-null")
    }

    /// Exclusive top of the stack (initial stack pointer).
    #[must_use]
    pub fn top(&self) -> NonNull<u8> {
        let total = frames::rank_bytes(STACK_RANK);
        // SAFETY: One-past-the-end of the same allocation.
        NonNull::new(unsafe { self.base.as_ptr().add(total) }).expect("stack base is non-null")
    }

    /// Base of the guard gap, for the kernel to unmap or poison.
    #[must_use]
    pub fn guard_page(&self) -> NonNull<u8> {
        self.base
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        frames::free_pages(self.base, STACK_RANK);
    }
}
