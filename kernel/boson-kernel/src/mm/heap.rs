//! Kernel heap: the size-class allocator as `GlobalAlloc`.
//!
//! Everything `alloc` hands out ultimately comes from OMA slabs (small
//! sizes) or whole page-frame allocations (large or over-aligned), so
//! heap objects never share pages with anything but same-class peers.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use boson_core::sync::LazyLock;
use boson_mm::sizeclass::UniversalAlloc;

static UNIVERSAL: LazyLock<UniversalAlloc> = LazyLock::new(UniversalAlloc::new);

/// Zero-sized handle implementing [`GlobalAlloc`].
pub struct KernelHeap;

// SAFETY: Forwards to UniversalAlloc, which returns exclusive, properly
// sized and aligned regions and accepts them back with the same layout.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match UNIVERSAL.alloc(layout) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            UNIVERSAL.dealloc(ptr, layout);
        }
    }
}

/// The kernel's global allocator (kernel target only; host tests use the
/// system allocator).
#[cfg(target_os = "none")]
#[global_allocator]
static GLOBAL_HEAP: KernelHeap = KernelHeap;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_dealloc_through_global_interface() {
        crate::test_support::install_frames();
        let layout = Layout::from_size_align(100, 8).unwrap();
        // SAFETY: Valid layout; freed with the same layout below.
        unsafe {
            let p = KernelHeap.alloc(layout);
            assert!(!p.is_null());
            core::ptr::write_bytes(p, 0xCD, 100);
            KernelHeap.dealloc(p, layout);
        }
    }
}
