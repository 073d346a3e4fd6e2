//! Physical memory manager.
//!
//! A bitmap allocator per usable memory region ("zone"). Each zone's
//! bitmap is carved out of the zone's own first pages, so the manager
//! needs no heap — it runs before any allocator exists. Once initialized
//! it registers itself as the page-frame provider every subsystem crate
//! allocates through.
//!
//! Rank-`r` allocations are `1 << r` contiguous pages.

use core::ptr::NonNull;

use planck_noalloc::vec::ArrayVec;

use boson_core::sync::IrqSpinLock;
use boson_core::{Error, Result, kinfo};
use boson_mm::frames::{self, PAGE_SIZE};

use super::hhdm;

/// Maximum usable memory regions accepted from the boot map.
const MAX_ZONES: usize = 32;

/// One usable physical memory region from the boot handoff.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    /// Physical base address.
    pub base: u64,
    /// Length in bytes.
    pub len: u64,
}

struct Zone {
    /// First allocatable physical page (past the bitmap).
    base: u64,
    /// Allocatable page count.
    pages: usize,
    /// Direct-mapped bitmap address; one bit per page, 1 = used.
    bitmap: *mut u64,
    /// Scan start hint.
    hint: usize,
}

// SAFETY: Zones are only touched under the PMM lock.
unsafe impl Send for Zone {}

impl Zone {
    fn bitmap(&mut self) -> &mut [u64] {
        // SAFETY: The bitmap was carved from the zone at init and covers
        // one word per 64 pages; exclusive access via the owner's lock.
        unsafe { core::slice::from_raw_parts_mut(self.bitmap, self.pages.div_ceil(64)) }
    }

    fn bit_is_set(map: &[u64], idx: usize) -> bool {
        map[idx / 64] & (1 << (idx % 64)) != 0
    }

    fn set_bits(map: &mut [u64], start: usize, count: usize) {
        for idx in start..start + count {
            map[idx / 64] |= 1 << (idx % 64);
        }
    }

    fn clear_bits(map: &mut [u64], start: usize, count: usize) {
        for idx in start..start + count {
            debug_assert!(Self::bit_is_set(map, idx), "freeing a free page");
            map[idx / 64] &= !(1 << (idx % 64));
        }
    }

    /// Finds and claims `count` pages aligned to `count`.
    fn claim(&mut self, count: usize) -> Option<u64> {
        let pages = self.pages;
        let base = self.base;
        let map = self.bitmap();

        let mut start = 0;
        while start + count <= pages {
            match (start..start + count).find(|&i| Self::bit_is_set(map, i)) {
                Some(busy) => {
                    // Skip past the collision, keeping alignment.
                    start = (busy + 1).next_multiple_of(count);
                }
                None => {
                    Self::set_bits(map, start, count);
                    self.hint = start + count;
                    return Some(base + (start * PAGE_SIZE) as u64);
                }
            }
        }
        None
    }

    fn release(&mut self, phys: u64, count: usize) {
        let start = ((phys - self.base) as usize) / PAGE_SIZE;
        let map = self.bitmap();
        Self::clear_bits(map, start, count);
        self.hint = self.hint.min(start);
    }

    fn contains(&self, phys: u64) -> bool {
        phys >= self.base && phys < self.base + (self.pages * PAGE_SIZE) as u64
    }
}

/// Zone set; the global instance lives behind [`init`] / [`alloc_frames`].
struct Pmm {
    zones: ArrayVec<Zone, MAX_ZONES>,
    free_pages: usize,
}

impl Pmm {
    const fn new() -> Self {
        Self {
            zones: ArrayVec::new(),
            free_pages: 0,
        }
    }

    fn add_regions(&mut self, regions: &[MemoryRegion]) {
        for region in regions {
            // Align the region inward to page boundaries.
            let base = region.base.next_multiple_of(PAGE_SIZE as u64);
            let end = (region.base + region.len) & !(PAGE_SIZE as u64 - 1);
            if end <= base {
                continue;
            }
            let total_pages = ((end - base) as usize) / PAGE_SIZE;

            // Carve the bitmap from the region head.
            let bitmap_bytes = total_pages.div_ceil(64) * 8;
            let bitmap_pages = bitmap_bytes.div_ceil(PAGE_SIZE);
            if bitmap_pages >= total_pages {
                continue;
            }
            let pages = total_pages - bitmap_pages;
            let bitmap = hhdm::phys_to_virt(base) as *mut u64;
            // SAFETY: The bitmap pages belong to this region and are
            // mapped through the direct map; zero = all free.
            unsafe { core::ptr::write_bytes(bitmap, 0, pages.div_ceil(64)) };

            if self
                .zones
                .try_push(Zone {
                    base: base + (bitmap_pages * PAGE_SIZE) as u64,
                    pages,
                    bitmap,
                    hint: 0,
                })
                .is_err()
            {
                break;
            }
            self.free_pages += pages;
        }
    }

    fn alloc(&mut self, rank: u32) -> Result<u64> {
        let count = 1usize << rank;
        for zone in self.zones.iter_mut() {
            if let Some(phys) = zone.claim(count) {
                self.free_pages -= count;
                return Ok(phys);
            }
        }
        Err(Error::NoMemory)
    }

    fn free(&mut self, phys: u64, rank: u32) {
        let count = 1usize << rank;
        for zone in self.zones.iter_mut() {
            if zone.contains(phys) {
                zone.release(phys, count);
                self.free_pages += count;
                return;
            }
        }
        debug_assert!(false, "freeing frames outside every zone");
    }
}

static PMM: IrqSpinLock<Pmm> = IrqSpinLock::new(Pmm::new());

/// Initializes the manager from the boot memory map and registers the
/// page-frame provider.
///
/// # Errors
///
/// `InvalidArgs` when no region is large enough to hold its bitmap.
pub fn init(regions: &[MemoryRegion]) -> Result<()> {
    let mut pmm = PMM.lock();
    pmm.add_regions(regions);
    if pmm.zones.is_empty() {
        return Err(Error::InvalidArgs);
    }
    kinfo!(
        "pmm: {} zones, {} MiB free",
        pmm.zones.len(),
        pmm.free_pages * PAGE_SIZE >> 20
    );
    drop(pmm);

    frames::set_provider(provider_alloc, provider_free);
    Ok(())
}

/// Allocates `1 << rank` pages; returns the physical base.
///
/// # Errors
///
/// `NoMemory` on exhaustion.
pub fn alloc_frames(rank: u32) -> Result<u64> {
    PMM.lock().alloc(rank)
}

/// Frees frames allocated with [`alloc_frames`].
pub fn free_frames(phys: u64, rank: u32) {
    PMM.lock().free(phys, rank);
}

/// Free page count.
#[must_use]
pub fn free_pages() -> usize {
    PMM.lock().free_pages
}

fn provider_alloc(rank: u32) -> Option<NonNull<u8>> {
    alloc_frames(rank)
        .ok()
        .map(|phys| NonNull::new(hhdm::phys_to_virt(phys) as *mut u8).expect("HHDM is non-null"))
}

fn provider_free(base: NonNull<u8>, rank: u32) {
    free_frames(hhdm::virt_to_phys(base.as_ptr() as u64), rank);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Leaks a page-aligned buffer standing in for physical memory.
    /// HHDM offset is zero on the host, so phys == virt.
    fn fake_region(pages: usize) -> MemoryRegion {
        let layout =
            std::alloc::Layout::from_size_align((pages + 1) * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: layout has non-zero size; the buffer is leaked for the
        // test process lifetime.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        MemoryRegion {
            base: ptr as u64,
            len: (pages * PAGE_SIZE) as u64,
        }
    }

    fn fresh_pmm(pages: usize) -> Pmm {
        let mut pmm = Pmm::new();
        pmm.add_regions(&[fake_region(pages)]);
        pmm
    }

    #[test]
    fn alloc_free_cycle() {
        let mut pmm = fresh_pmm(64);
        let before = pmm.free_pages;

        let a = pmm.alloc(0).unwrap();
        let b = pmm.alloc(2).unwrap();
        assert_ne!(a, b);
        assert_eq!(pmm.free_pages, before - 5);

        pmm.free(a, 0);
        pmm.free(b, 2);
        assert_eq!(pmm.free_pages, before);
    }

    #[test]
    fn distinct_allocations_do_not_overlap() {
        let mut pmm = fresh_pmm(64);
        let mut seen: Vec<u64> = Vec::new();
        for _ in 0..8 {
            let phys = pmm.alloc(1).unwrap();
            assert!(seen.iter().all(|&p| p.abs_diff(phys) >= 2 * PAGE_SIZE as u64));
            seen.push(phys);
        }
        for phys in seen {
            pmm.free(phys, 1);
        }
    }

    #[test]
    fn exhaustion_reports_no_memory() {
        let mut pmm = fresh_pmm(16);
        let mut held = Vec::new();
        while let Ok(phys) = pmm.alloc(0) {
            held.push(phys);
            assert!(held.len() < 100, "allocator never exhausts");
        }
        assert_eq!(pmm.free_pages, 0);
        for phys in &held {
            pmm.free(*phys, 0);
        }
        assert_eq!(pmm.free_pages, held.len());
    }

    #[test]
    fn bitmap_reuse_after_free() {
        let mut pmm = fresh_pmm(16);
        let first = pmm.alloc(3).unwrap();
        pmm.free(first, 3);
        let second = pmm.alloc(3).unwrap();
        assert_eq!(first, second);
        pmm.free(second, 3);
    }
}
