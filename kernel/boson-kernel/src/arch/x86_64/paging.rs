//! Four-level page tables.
//!
//! [`PageTableMapper`] implements the generic [`PageMapper`] interface
//! over real PML4 trees. Table frames come from the PMM through the
//! direct map; user roots share the kernel half by copying the upper 256
//! PML4 entries from the boot tables.

use core::sync::atomic::{AtomicU64, Ordering};

use boson_core::{Error, Result};
use boson_mm::frames::{self, PAGE_SIZE};

use crate::mm::addr_space::{MapFlags, PageMapper};
use crate::mm::hhdm;

use super::instructions;

const PTE_PRESENT: u64 = 1 << 0;
const PTE_WRITE: u64 = 1 << 1;
const PTE_USER: u64 = 1 << 2;
const PTE_DIRTY: u64 = 1 << 6;
const PTE_GLOBAL: u64 = 1 << 8;
const PTE_NX: u64 = 1 << 63;

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// The kernel's own root table, captured at boot.
static KERNEL_ROOT: AtomicU64 = AtomicU64::new(0);

/// Records the boot page tables as the kernel root and registers the
/// scheduler's kernel-space activation hook.
pub fn init_kernel_root() {
    KERNEL_ROOT.store(instructions::read_cr3() & ADDR_MASK, Ordering::Release);
    boson_sched::set_kernel_space_hook(activate_kernel_root);
}

fn activate_kernel_root() {
    let root = KERNEL_ROOT.load(Ordering::Acquire);
    if root != 0 && instructions::read_cr3() & ADDR_MASK != root {
        // SAFETY: The kernel root maps all kernel code and data.
        unsafe { instructions::write_cr3(root) };
    }
}

/// Loads an address-space root (scheduler switch path).
///
/// # Safety
///
/// `phys` must be a live PML4 covering the kernel half.
pub unsafe fn load_root(phys: u64) {
    if instructions::read_cr3() & ADDR_MASK != phys {
        // SAFETY: Caller contract.
        unsafe { instructions::write_cr3(phys) };
    }
}

fn table_of(phys: u64) -> *mut u64 {
    hhdm::phys_to_virt(phys & ADDR_MASK) as *mut u64
}

fn index_of(virt: u64, level: u32) -> usize {
    ((virt >> (12 + 9 * level)) & 0x1FF) as usize
}

fn flags_to_pte(flags: MapFlags) -> u64 {
    let mut pte = PTE_PRESENT;
    if flags.contains(MapFlags::WRITE) {
        pte |= PTE_WRITE;
    }
    if flags.contains(MapFlags::USER) {
        pte |= PTE_USER;
    }
    if flags.contains(MapFlags::GLOBAL) {
        pte |= PTE_GLOBAL;
    }
    if !flags.contains(MapFlags::EXEC) {
        pte |= PTE_NX;
    }
    pte
}

/// A page-table tree rooted at one PML4 frame.
pub struct PageTableMapper {
    root: u64,
}

// SAFETY: The tree is owned; concurrent access goes through the address
// space's map lock.
unsafe impl Send for PageTableMapper {}

impl PageTableMapper {
    /// Allocates a fresh root sharing the kernel half.
    ///
    /// # Panics
    ///
    /// Panics if the root frame cannot be allocated (process creation
    /// handles allocation failure before this point).
    #[must_use]
    pub fn new() -> Self {
        let frame = frames::alloc_pages(0).expect("PML4 frame");
        let root = hhdm::virt_to_phys(frame.as_ptr() as u64);
        // SAFETY: Fresh exclusive frame via the direct map.
        unsafe {
            core::ptr::write_bytes(frame.as_ptr(), 0, PAGE_SIZE);
            // Share the kernel half (entries 256..512).
            let kernel_root = KERNEL_ROOT.load(Ordering::Acquire);
            if kernel_root != 0 {
                let src = table_of(kernel_root);
                let dst = frame.as_ptr().cast::<u64>();
                for i in 256..512 {
                    dst.add(i).write(src.add(i).read());
                }
            }
        }
        Self { root }
    }

    /// Walks to the PTE for `virt`, optionally allocating intermediate
    /// tables. Returns a direct-map pointer to the PTE slot.
    fn walk(&self, virt: u64, create: bool) -> Result<*mut u64> {
        let mut table = table_of(self.root);
        for level in [3u32, 2, 1] {
            // SAFETY: `table` is a live table frame via the direct map.
            let slot = unsafe { table.add(index_of(virt, level)) };
            // SAFETY: As above.
            let entry = unsafe { slot.read() };
            if entry & PTE_PRESENT == 0 {
                if !create {
                    return Err(Error::NoEnt);
                }
                let frame = frames::alloc_pages(0)?;
                // SAFETY: Fresh exclusive table frame.
                unsafe { core::ptr::write_bytes(frame.as_ptr(), 0, PAGE_SIZE) };
                let phys = hhdm::virt_to_phys(frame.as_ptr() as u64);
                // Intermediate entries stay maximally permissive; the
                // leaf PTE carries the real permissions.
                // SAFETY: Writing the just-checked empty slot.
                unsafe { slot.write(phys | PTE_PRESENT | PTE_WRITE | PTE_USER) };
                table = table_of(phys);
            } else {
                table = table_of(entry);
            }
        }
        // SAFETY: Leaf table reached; index within the 512 entries.
        Ok(unsafe { table.add(index_of(virt, 0)) })
    }
}

impl Default for PageTableMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl PageMapper for PageTableMapper {
    fn map(&mut self, virt: u64, phys: u64, flags: MapFlags) -> Result<()> {
        let slot = self.walk(virt, true)?;
        // SAFETY: `slot` points at the PTE for `virt`.
        unsafe { slot.write((phys & ADDR_MASK) | flags_to_pte(flags)) };
        Ok(())
    }

    fn unmap(&mut self, virt: u64) -> Result<(u64, bool)> {
        let slot = self.walk(virt, false)?;
        // SAFETY: As in map.
        let entry = unsafe { slot.read() };
        if entry & PTE_PRESENT == 0 {
            return Err(Error::NoEnt);
        }
        // SAFETY: As in map.
        unsafe { slot.write(0) };
        // SAFETY: Invalidating the dropped translation.
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) virt, options(nostack));
        }
        Ok((entry & ADDR_MASK, entry & PTE_DIRTY != 0))
    }

    fn translate(&self, virt: u64) -> Option<u64> {
        let slot = self.walk(virt, false).ok()?;
        // SAFETY: As in map.
        let entry = unsafe { slot.read() };
        (entry & PTE_PRESENT != 0).then_some(entry & ADDR_MASK)
    }

    fn root_phys(&self) -> u64 {
        self.root
    }
}

impl Drop for PageTableMapper {
    fn drop(&mut self) {
        // Free the lower-half intermediate tables; leaf frames belong to
        // the map units, and the kernel half belongs to the boot tables.
        fn free_level(table_phys: u64, level: u32, user_half_only: bool) {
            let table = table_of(table_phys);
            let limit = if user_half_only { 256 } else { 512 };
            for i in 0..limit {
                // SAFETY: Live table frame via the direct map.
                let entry = unsafe { table.add(i).read() };
                if entry & PTE_PRESENT != 0 && level > 1 {
                    free_level(entry & ADDR_MASK, level - 1, false);
                }
            }
            let virt = hhdm::phys_to_virt(table_phys & ADDR_MASK) as *mut u8;
            // SAFETY: The table frame was allocated by walk/new and is no
            // longer referenced.
            unsafe {
                frames::free_pages(core::ptr::NonNull::new_unchecked(virt), 0);
            }
        }
        free_level(self.root, 4, true);
    }
}
