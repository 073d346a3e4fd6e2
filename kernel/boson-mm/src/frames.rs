//! Page-frame provider registration.
//!
//! Allocators in this crate obtain backing pages through two registered
//! function pointers. The kernel installs its physical memory manager
//! during boot; host tests install a `std::alloc`-backed provider. Until
//! registration every request fails with `NoMemory`.
//!
//! A *rank* is a power-of-two page count: rank `r` means `1 << r` pages.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};

use boson_core::{Error, Result};

/// Size of one page frame in bytes.
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;

/// Signature of the registered page allocator: returns the base of
/// `1 << rank` contiguous, writable pages.
pub type AllocPagesFn = fn(rank: u32) -> Option<NonNull<u8>>;

/// Signature of the registered page deallocator.
pub type FreePagesFn = fn(base: NonNull<u8>, rank: u32);

fn no_alloc(_rank: u32) -> Option<NonNull<u8>> {
    None
}

fn no_free(_base: NonNull<u8>, _rank: u32) {}

static ALLOC_FN: AtomicPtr<()> = AtomicPtr::new(no_alloc as *mut ());
static FREE_FN: AtomicPtr<()> = AtomicPtr::new(no_free as *mut ());

/// Registers the page-frame provider.
pub fn set_provider(alloc: AllocPagesFn, free: FreePagesFn) {
    ALLOC_FN.store(alloc as *mut (), Ordering::Release);
    FREE_FN.store(free as *mut (), Ordering::Release);
}

/// Returns the number of bytes covered by an allocation of `rank`.
#[must_use]
pub const fn rank_bytes(rank: u32) -> usize {
    PAGE_SIZE << rank
}

/// Allocates `1 << rank` contiguous pages.
///
/// # Errors
///
/// Returns [`Error::NoMemory`] when the provider is exhausted or not yet
/// registered.
pub fn alloc_pages(rank: u32) -> Result<NonNull<u8>> {
    let ptr = ALLOC_FN.load(Ordering::Acquire);
    // SAFETY: ALLOC_FN only ever holds a valid `AllocPagesFn`.
    let f: AllocPagesFn = unsafe { core::mem::transmute(ptr) };
    f(rank).ok_or(Error::NoMemory)
}

/// Frees pages previously returned by [`alloc_pages`] with the same rank.
pub fn free_pages(base: NonNull<u8>, rank: u32) {
    let ptr = FREE_FN.load(Ordering::Acquire);
    // SAFETY: FREE_FN only ever holds a valid `FreePagesFn`.
    let f: FreePagesFn = unsafe { core::mem::transmute(ptr) };
    f(base, rank);
}

/// Host-side provider backed by the system allocator, shared by the unit
/// tests of every module in this crate.
#[cfg(test)]
pub(crate) mod test_provider {
    use super::*;
    use core::alloc::Layout;

    fn layout(rank: u32) -> Layout {
        Layout::from_size_align(rank_bytes(rank), PAGE_SIZE).unwrap()
    }

    fn host_alloc(rank: u32) -> Option<NonNull<u8>> {
        // SAFETY: layout has non-zero size.
        NonNull::new(unsafe { std::alloc::alloc_zeroed(layout(rank)) })
    }

    fn host_free(base: NonNull<u8>, rank: u32) {
        // SAFETY: `base` came from `host_alloc` with the same rank.
        unsafe { std::alloc::dealloc(base.as_ptr(), layout(rank)) };
    }

    /// Installs the host provider. Idempotent; every test calls it first.
    pub fn install() {
        set_provider(host_alloc, host_free);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_free_roundtrip() {
        test_provider::install();
        let base = alloc_pages(1).unwrap();
        // Whole region must be writable.
        // SAFETY: The provider returned 2 valid pages.
        unsafe { core::ptr::write_bytes(base.as_ptr(), 0xAB, rank_bytes(1)) };
        free_pages(base, 1);
    }

    #[test]
    fn rank_bytes_scales() {
        assert_eq!(rank_bytes(0), PAGE_SIZE);
        assert_eq!(rank_bytes(3), PAGE_SIZE * 8);
    }
}
