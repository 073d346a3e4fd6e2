//! Process address spaces and map units.
//!
//! An address space is a sorted list of map units — contiguous virtual
//! ranges with uniform flags and backing — over an architecture page
//! mapper. Nothing is populated eagerly: the page-fault handler finds
//! the covering unit and either installs a fresh zeroed page (anonymous)
//! or maps a page out of the backing file's cache block (file-backed
//! mmap). Unmapping propagates hardware dirty bits into the cache
//! block's dirty map so eviction can write the data back.
//!
//! The mapper is generic so the logic tests on the host against a table
//! mapper; the kernel target plugs in the real page-table walker.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use boson_core::sync::SpinLock;
use boson_core::{Error, Result};
use boson_fs::File;
use boson_mm::cache::CacheBlock;
use boson_mm::frames::{self, PAGE_SIZE};

use super::hhdm;

bitflags! {
    /// Map-unit permission and placement flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Readable.
        const READ   = 1 << 0;
        /// Writable.
        const WRITE  = 1 << 1;
        /// Executable.
        const EXEC   = 1 << 2;
        /// User-mode accessible.
        const USER   = 1 << 3;
        /// Global TLB entry (kernel ranges).
        const GLOBAL = 1 << 4;
    }
}

/// Architecture page-table interface.
pub trait PageMapper: Send {
    /// Installs a 4 KiB translation.
    ///
    /// # Errors
    ///
    /// `NoMemory` if an intermediate table cannot be allocated.
    fn map(&mut self, virt: u64, phys: u64, flags: MapFlags) -> Result<()>;

    /// Removes a translation; returns `(phys, dirty)`.
    ///
    /// # Errors
    ///
    /// `NoEnt` if the page was not mapped.
    fn unmap(&mut self, virt: u64) -> Result<(u64, bool)>;

    /// Looks up a translation.
    fn translate(&self, virt: u64) -> Option<u64>;

    /// Physical address of the root table (for CR3).
    fn root_phys(&self) -> u64;
}

/// What backs a map unit.
pub enum UnitBacking {
    /// Demand-zero memory.
    Anonymous,
    /// A file region: unit page `i` is file page `page_offset + i`.
    File {
        /// Backing open file.
        file: Arc<File>,
        /// File page index of the unit's first page.
        page_offset: u64,
    },
}

/// One installed page of a unit, recorded for teardown.
enum ResidentPage {
    /// Anonymous page owning its frame.
    Anon {
        /// Page virtual address.
        virt: u64,
    },
    /// Page inside a cache block; the reference pins the block.
    Cached {
        /// Page virtual address.
        virt: u64,
        /// Covering block.
        block: Arc<CacheBlock>,
        /// Page index within the block.
        block_page: usize,
    },
}

/// A contiguous virtual range with uniform backing and flags.
pub struct MapUnit {
    /// First virtual address.
    pub base: u64,
    /// Length in bytes (page multiple).
    pub len: u64,
    /// Permissions.
    pub flags: MapFlags,
    /// Backing store.
    pub backing: UnitBacking,
    /// Stack semantics: faults one page below the base extend the unit.
    pub grow_down: bool,
    /// Pages currently installed.
    resident: Vec<ResidentPage>,
}

impl MapUnit {
    fn contains(&self, virt: u64) -> bool {
        virt >= self.base && virt < self.base + self.len
    }

    fn end(&self) -> u64 {
        self.base + self.len
    }
}

/// A process address space: map units over a page mapper.
pub struct AddressSpace<M: PageMapper> {
    /// The page-table walker; the map lock orders walk vs. modify.
    mapper: SpinLock<M>,
    /// Sorted, non-overlapping units.
    units: SpinLock<Vec<MapUnit>>,
}

impl<M: PageMapper> AddressSpace<M> {
    /// Wraps a mapper into an empty address space.
    #[must_use]
    pub fn new(mapper: M) -> Self {
        Self {
            mapper: SpinLock::new(mapper),
            units: SpinLock::new(Vec::new()),
        }
    }

    /// Physical root-table address.
    #[must_use]
    pub fn root_phys(&self) -> u64 {
        self.mapper.lock().root_phys()
    }

    /// Current translation of `virt`, if installed.
    #[must_use]
    pub fn translate(&self, virt: u64) -> Option<u64> {
        self.mapper.lock().translate(virt)
    }

    fn insert_unit(&self, unit: MapUnit) -> Result<()> {
        let mut units = self.units.lock();
        let pos = units.partition_point(|u| u.base < unit.base);
        // Reject overlap with either neighbour.
        if pos > 0 && units[pos - 1].end() > unit.base {
            return Err(Error::Exists);
        }
        if pos < units.len() && units[pos].base < unit.end() {
            return Err(Error::Exists);
        }
        units.insert(pos, unit);
        Ok(())
    }

    /// Creates an anonymous unit at a fixed base.
    ///
    /// # Errors
    ///
    /// `InvalidArgs` for unaligned ranges, `Exists` on overlap.
    pub fn map_anonymous(&self, base: u64, len: u64, flags: MapFlags, grow_down: bool) -> Result<()> {
        if base % PAGE_SIZE as u64 != 0 || len == 0 || len % PAGE_SIZE as u64 != 0 {
            return Err(Error::InvalidArgs);
        }
        self.insert_unit(MapUnit {
            base,
            len,
            flags,
            backing: UnitBacking::Anonymous,
            grow_down,
            resident: Vec::new(),
        })
    }

    /// Creates a file-backed unit at a fixed base.
    ///
    /// # Errors
    ///
    /// `InvalidArgs` for unaligned ranges, `Exists` on overlap.
    pub fn map_file(
        &self,
        base: u64,
        len: u64,
        flags: MapFlags,
        file: Arc<File>,
        page_offset: u64,
    ) -> Result<()> {
        if base % PAGE_SIZE as u64 != 0 || len == 0 || len % PAGE_SIZE as u64 != 0 {
            return Err(Error::InvalidArgs);
        }
        self.insert_unit(MapUnit {
            base,
            len,
            flags,
            backing: UnitBacking::File { file, page_offset },
            grow_down: false,
            resident: Vec::new(),
        })
    }

    /// Finds a free range of `len` bytes at or above `floor`, aligned to
    /// `align` (a power of two, at least a page).
    ///
    /// # Errors
    ///
    /// `NoMemory` when the hole search exhausts the canonical range.
    pub fn find_free_range(&self, floor: u64, len: u64, align: u64) -> Result<u64> {
        let align = align.max(PAGE_SIZE as u64);
        let units = self.units.lock();
        let mut candidate = floor.next_multiple_of(align);
        for unit in units.iter() {
            if unit.end() <= candidate {
                continue;
            }
            if unit.base >= candidate + len {
                break;
            }
            candidate = unit.end().next_multiple_of(align);
        }
        candidate
            .checked_add(len)
            .ok_or(Error::NoMemory)
            .map(|_| candidate)
    }

    /// Handles a page fault at `virt`.
    ///
    /// # Errors
    ///
    /// `SegFault` when no unit covers the address or the access kind is
    /// not permitted; allocation and I/O errors pass through.
    pub fn handle_fault(&self, virt: u64, write: bool) -> Result<()> {
        let page_virt = virt & !(PAGE_SIZE as u64 - 1);
        let mut units = self.units.lock();

        let pos = units.iter().position(|u| u.contains(virt)).or_else(|| {
            // A stack unit grows one page at a time below its base.
            units
                .iter()
                .position(|u| u.grow_down && u.base == page_virt + PAGE_SIZE as u64)
        });
        let unit = match pos {
            Some(pos) => &mut units[pos],
            None => return Err(Error::SegFault),
        };
        if !unit.contains(virt) {
            unit.base = page_virt;
            unit.len += PAGE_SIZE as u64;
        }

        if write && !unit.flags.contains(MapFlags::WRITE) {
            return Err(Error::SegFault);
        }
        // Already installed: a stale fault from a racing sibling thread.
        if self.mapper.lock().translate(page_virt).is_some() {
            return Ok(());
        }

        match &unit.backing {
            UnitBacking::Anonymous => {
                let frame = frames::alloc_pages(0)?;
                // SAFETY: Fresh exclusive frame.
                unsafe { core::ptr::write_bytes(frame.as_ptr(), 0, PAGE_SIZE) };
                let phys = hhdm::virt_to_phys(frame.as_ptr() as u64);
                self.mapper.lock().map(page_virt, phys, unit.flags)?;
                unit.resident.push(ResidentPage::Anon { virt: page_virt });
            }
            UnitBacking::File { file, page_offset } => {
                // File byte offset = (page_offset + unit-relative page) * page size.
                let unit_page = (page_virt - unit.base) / PAGE_SIZE as u64;
                let file_page = page_offset + unit_page;
                let inode = file.dentry.inode().ok_or(Error::BadInode)?;
                let pages_per_block = (inode.cache.block_size().bytes() / PAGE_SIZE) as u64;
                let block_index = (file_page / pages_per_block) as u32;
                let block_page = (file_page % pages_per_block) as usize;
                let block = file.mmap_block(block_index)?;
                let phys = hhdm::virt_to_phys(block.page_at(block_page).as_ptr() as u64);
                self.mapper.lock().map(page_virt, phys, unit.flags)?;
                unit.resident.push(ResidentPage::Cached {
                    virt: page_virt,
                    block,
                    block_page,
                });
            }
        }
        Ok(())
    }

    /// Tears down the unit containing `base`, returning its frames and
    /// propagating hardware dirty bits into cache blocks.
    ///
    /// # Errors
    ///
    /// `NoEnt` when no unit starts at `base`.
    pub fn unmap_unit(&self, base: u64) -> Result<()> {
        let mut units = self.units.lock();
        let pos = units
            .iter()
            .position(|u| u.base == base)
            .ok_or(Error::NoEnt)?;
        let unit = units.remove(pos);
        drop(units);

        let writable = unit.flags.contains(MapFlags::WRITE);
        let mut mapper = self.mapper.lock();
        for page in unit.resident {
            match page {
                ResidentPage::Anon { virt } => {
                    if let Ok((phys, _)) = mapper.unmap(virt) {
                        let frame = hhdm::phys_to_virt(phys) as *mut u8;
                        // SAFETY: The frame was allocated for this page in
                        // handle_fault and is no longer mapped.
                        unsafe {
                            frames::free_pages(core::ptr::NonNull::new_unchecked(frame), 0);
                        }
                    }
                }
                ResidentPage::Cached {
                    virt,
                    block,
                    block_page,
                } => {
                    if let Ok((_, dirty)) = mapper.unmap(virt) {
                        if writable && dirty {
                            block.mark_dirty(block_page * PAGE_SIZE, PAGE_SIZE);
                        }
                    }
                    // Block reference drops here; eviction serialises the
                    // actual write-back.
                }
            }
        }
        Ok(())
    }

    /// Snapshot of `(base, len)` for every unit (diagnostics).
    #[must_use]
    pub fn unit_ranges(&self) -> Vec<(u64, u64)> {
        self.units.lock().iter().map(|u| (u.base, u.len)).collect()
    }

    /// Copies `bytes` into user memory at `addr`, faulting pages in.
    ///
    /// # Errors
    ///
    /// `SegFault` when the range is not covered by a writable unit.
    pub fn copy_to_user(&self, addr: u64, bytes: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < bytes.len() {
            let pos = addr + done as u64;
            let page = pos & !(PAGE_SIZE as u64 - 1);
            if self.mapper.lock().translate(page).is_none() {
                self.handle_fault(pos, true)?;
            }
            let phys = self
                .mapper
                .lock()
                .translate(page)
                .ok_or(Error::SegFault)?;
            let inside = (pos - page) as usize;
            let take = (bytes.len() - done).min(PAGE_SIZE - inside);
            let dst = hhdm::phys_to_virt(phys) as *mut u8;
            // SAFETY: The page backs a mapped unit; `inside + take` stays
            // within it.
            unsafe {
                core::ptr::copy_nonoverlapping(bytes[done..].as_ptr(), dst.add(inside), take);
            }
            done += take;
        }
        Ok(())
    }

    /// Copies user memory at `addr` into `bytes`, faulting pages in.
    ///
    /// # Errors
    ///
    /// `SegFault` when the range is not covered by a readable unit.
    pub fn copy_from_user(&self, addr: u64, bytes: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < bytes.len() {
            let pos = addr + done as u64;
            let page = pos & !(PAGE_SIZE as u64 - 1);
            if self.mapper.lock().translate(page).is_none() {
                self.handle_fault(pos, false)?;
            }
            let phys = self
                .mapper
                .lock()
                .translate(page)
                .ok_or(Error::SegFault)?;
            let inside = (pos - page) as usize;
            let take = (bytes.len() - done).min(PAGE_SIZE - inside);
            let src = hhdm::phys_to_virt(phys) as *const u8;
            // SAFETY: As in copy_to_user.
            unsafe {
                core::ptr::copy_nonoverlapping(src.add(inside), bytes[done..].as_mut_ptr(), take);
            }
            done += take;
        }
        Ok(())
    }
}

/// Host stand-in for the page-table walker: a sorted map from page
/// address to `(phys, dirty)`. Process-layer code builds against this on
/// the host; the kernel target uses the real table walker.
#[cfg(not(target_os = "none"))]
pub struct HostMapper {
    entries: alloc::collections::BTreeMap<u64, (u64, bool)>,
}

#[cfg(not(target_os = "none"))]
impl HostMapper {
    /// Creates an empty mapper.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: alloc::collections::BTreeMap::new(),
        }
    }

    /// Forces the dirty bit of a mapped page (simulated hardware write).
    pub fn set_dirty(&mut self, virt: u64) {
        if let Some(entry) = self.entries.get_mut(&virt) {
            entry.1 = true;
        }
    }
}

#[cfg(not(target_os = "none"))]
impl Default for HostMapper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(target_os = "none"))]
impl PageMapper for HostMapper {
    fn map(&mut self, virt: u64, phys: u64, _flags: MapFlags) -> Result<()> {
        self.entries.insert(virt, (phys, false));
        Ok(())
    }

    fn unmap(&mut self, virt: u64) -> Result<(u64, bool)> {
        self.entries.remove(&virt).ok_or(Error::NoEnt)
    }

    fn translate(&self, virt: u64) -> Option<u64> {
        self.entries.get(&virt).map(|&(p, _)| p)
    }

    fn root_phys(&self) -> u64 {
        0x1000
    }
}
