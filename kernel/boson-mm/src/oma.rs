//! OMA — object memory allocator.
//!
//! A fixed-size-object slab. Each arena is one contiguous page-rank
//! allocation holding a bitmap followed by object slots. Objects are
//! addressable by a *global index* with a fixed bijection:
//!
//! `index = arena_ordinal * arena_capacity + slot`
//! `address = arenas[index / capacity].objects + (index % capacity) * size`
//!
//! Drive request slabs rely on this to complete I/O by a 16-bit id instead
//! of carrying a pointer across the DMA boundary.
//!
//! [`Oma`] itself is not thread-safe; [`SafeOma`] wraps it in an
//! interrupt-saving spin lock, since frees arrive from IRQ completion
//! handlers. New arenas are only ever grown from task context.

use alloc::vec::Vec;
use core::ptr::NonNull;

use boson_core::sync::IrqSpinLock;
use boson_core::{Error, Result};

use crate::frames;

/// Object slot alignment guaranteed by every arena.
const SLOT_ALIGN: usize = 16;

/// One contiguous arena: bitmap words, then object slots.
struct Arena {
    base: NonNull<u8>,
    used: u32,
}

// SAFETY: Arenas are raw memory owned by the Oma; access is serialized by
// the owner (SafeOma's lock or exclusive &mut).
unsafe impl Send for Arena {}

/// A typed-size slab allocator with bitmap bookkeeping.
pub struct Oma {
    object_size: usize,
    arena_rank: u32,
    capacity: u32,
    bitmap_words: usize,
    arenas: Vec<Arena>,
}

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Bytes of bitmap needed for `capacity` objects, padded to slot alignment.
const fn bitmap_area(capacity: u32) -> usize {
    align_up(capacity.div_ceil(64) as usize * 8, SLOT_ALIGN)
}

impl Oma {
    /// Creates an allocator with the largest capacity that fits the arena.
    ///
    /// `object_size` must be a multiple of the objects' required alignment
    /// (at most [`SLOT_ALIGN`]).
    #[must_use]
    pub fn new(object_size: usize, arena_rank: u32) -> Self {
        let bytes = frames::rank_bytes(arena_rank);
        let mut capacity = (bytes / object_size) as u32;
        while capacity > 0 && bitmap_area(capacity) + capacity as usize * object_size > bytes {
            capacity -= 1;
        }
        Self::with_capacity(object_size, arena_rank, capacity)
    }

    /// Creates an allocator with an explicit per-arena capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` objects plus the bitmap do not fit in one
    /// arena, or if `object_size` is zero.
    #[must_use]
    pub fn with_capacity(object_size: usize, arena_rank: u32, capacity: u32) -> Self {
        assert!(object_size > 0, "zero-sized objects");
        assert!(capacity > 0, "zero-capacity arena");
        assert!(
            bitmap_area(capacity) + capacity as usize * object_size
                <= frames::rank_bytes(arena_rank),
            "arena capacity does not fit the page rank"
        );
        Self {
            object_size,
            arena_rank,
            capacity,
            bitmap_words: capacity.div_ceil(64) as usize,
            arenas: Vec::new(),
        }
    }

    /// Creates an allocator sized for `T` with the given arena rank.
    #[must_use]
    pub fn for_type<T>(arena_rank: u32) -> Self {
        let stride = align_up(core::mem::size_of::<T>().max(1), core::mem::align_of::<T>());
        assert!(core::mem::align_of::<T>() <= SLOT_ALIGN);
        Self::new(stride, arena_rank)
    }

    /// Objects per arena.
    #[must_use]
    pub fn arena_capacity(&self) -> u32 {
        self.capacity
    }

    /// Currently allocated object count.
    #[must_use]
    pub fn used(&self) -> usize {
        self.arenas.iter().map(|a| a.used as usize).sum()
    }

    fn bitmap<'a>(&self, arena: &'a Arena) -> &'a mut [u64] {
        // SAFETY: The arena region starts with `bitmap_words` words, zeroed
        // at arena creation; exclusive access is the owner's invariant.
        unsafe {
            core::slice::from_raw_parts_mut(arena.base.as_ptr().cast::<u64>(), self.bitmap_words)
        }
    }

    fn objects_base(&self, arena: &Arena) -> *mut u8 {
        // SAFETY: The objects area begins right after the padded bitmap,
        // inside the same arena allocation.
        unsafe { arena.base.as_ptr().add(bitmap_area(self.capacity)) }
    }

    fn grow(&mut self) -> Result<()> {
        let base = frames::alloc_pages(self.arena_rank)?;
        // SAFETY: The provider returned a fresh writable region large
        // enough for the bitmap; zero it so all slots read as free.
        unsafe {
            core::ptr::write_bytes(base.as_ptr(), 0, bitmap_area(self.capacity));
        }
        self.arenas.push(Arena { base, used: 0 });
        Ok(())
    }

    /// Allocates one object slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMemory`] when no slot is free and a new arena
    /// cannot be obtained.
    pub fn alloc(&mut self) -> Result<NonNull<u8>> {
        self.alloc_indexed().map(|(ptr, _)| ptr)
    }

    /// Allocates one object slot and returns its global index.
    pub fn alloc_indexed(&mut self) -> Result<(NonNull<u8>, u32)> {
        for ai in 0..self.arenas.len() {
            if self.arenas[ai].used == self.capacity {
                continue;
            }
            if let Some(slot) = self.claim_slot(ai) {
                return Ok((self.slot_ptr(ai, slot), ai as u32 * self.capacity + slot));
            }
        }
        // Every arena full: grow and take slot 0 of the new arena.
        self.grow()?;
        let ai = self.arenas.len() - 1;
        let slot = self.claim_slot(ai).expect("fresh arena has free slots");
        Ok((self.slot_ptr(ai, slot), ai as u32 * self.capacity + slot))
    }

    fn claim_slot(&mut self, ai: usize) -> Option<u32> {
        let capacity = self.capacity;
        let claimed = {
            let bitmap = self.bitmap(&self.arenas[ai]);
            let mut claimed = None;
            for (wi, word) in bitmap.iter_mut().enumerate() {
                if *word == u64::MAX {
                    continue;
                }
                let bit = word.trailing_ones();
                let slot = wi as u32 * 64 + bit;
                if slot >= capacity {
                    break;
                }
                *word |= 1 << bit;
                claimed = Some(slot);
                break;
            }
            claimed
        }?;
        self.arenas[ai].used += 1;
        Some(claimed)
    }

    fn slot_ptr(&self, ai: usize, slot: u32) -> NonNull<u8> {
        let base = self.objects_base(&self.arenas[ai]);
        // SAFETY: `slot < capacity`, so the offset stays inside the arena.
        NonNull::new(unsafe { base.add(slot as usize * self.object_size) })
            .expect("arena base is non-null")
    }

    /// Resolves a global index to the object address, if allocated.
    #[must_use]
    pub fn addr_of(&self, index: u32) -> Option<NonNull<u8>> {
        let ai = (index / self.capacity) as usize;
        let slot = index % self.capacity;
        let arena = self.arenas.get(ai)?;
        let word = self.bitmap(arena)[(slot / 64) as usize];
        if word & (1 << (slot % 64)) == 0 {
            return None;
        }
        Some(self.slot_ptr(ai, slot))
    }

    /// Resolves an object address back to its global index.
    ///
    /// Walks the arena list with a containing-range test.
    #[must_use]
    pub fn index_of(&self, ptr: NonNull<u8>) -> Option<u32> {
        let addr = ptr.as_ptr() as usize;
        for (ai, arena) in self.arenas.iter().enumerate() {
            let objects = self.objects_base(arena) as usize;
            let end = objects + self.capacity as usize * self.object_size;
            if addr >= objects && addr < end {
                let slot = ((addr - objects) / self.object_size) as u32;
                return Some(ai as u32 * self.capacity + slot);
            }
        }
        None
    }

    /// Frees an object by address.
    ///
    /// Returns `false` if the address does not belong to this allocator.
    pub fn free(&mut self, ptr: NonNull<u8>) -> bool {
        match self.index_of(ptr) {
            Some(index) => {
                self.free_index(index);
                true
            }
            None => false,
        }
    }

    /// Frees an object by its global index.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not currently allocated (double free).
    pub fn free_index(&mut self, index: u32) {
        let ai = (index / self.capacity) as usize;
        let slot = index % self.capacity;
        assert!(ai < self.arenas.len(), "index beyond arena list");
        {
            let bitmap = self.bitmap(&self.arenas[ai]);
            let word = &mut bitmap[(slot / 64) as usize];
            let mask = 1u64 << (slot % 64);
            assert!(*word & mask != 0, "double free of OMA slot");
            *word &= !mask;
        }
        self.arenas[ai].used -= 1;
    }
}

impl Drop for Oma {
    fn drop(&mut self) {
        for arena in &self.arenas {
            frames::free_pages(arena.base, self.arena_rank);
        }
    }
}

/// An [`Oma`] behind an interrupt-saving spin lock.
pub struct SafeOma {
    inner: IrqSpinLock<Oma>,
}

impl SafeOma {
    /// Creates a locked allocator with the largest capacity that fits.
    #[must_use]
    pub fn new(object_size: usize, arena_rank: u32) -> Self {
        Self {
            inner: IrqSpinLock::new(Oma::new(object_size, arena_rank)),
        }
    }

    /// Creates a locked allocator with an explicit per-arena capacity.
    #[must_use]
    pub fn with_capacity(object_size: usize, arena_rank: u32, capacity: u32) -> Self {
        Self {
            inner: IrqSpinLock::new(Oma::with_capacity(object_size, arena_rank, capacity)),
        }
    }

    /// Objects per arena.
    #[must_use]
    pub fn arena_capacity(&self) -> u32 {
        self.inner.lock().arena_capacity()
    }

    /// Allocates one object slot. See [`Oma::alloc`].
    pub fn alloc(&self) -> Result<NonNull<u8>> {
        self.inner.lock().alloc()
    }

    /// Allocates one object slot with its global index.
    pub fn alloc_indexed(&self) -> Result<(NonNull<u8>, u32)> {
        self.inner.lock().alloc_indexed()
    }

    /// Resolves a global index to the object address, if allocated.
    pub fn addr_of(&self, index: u32) -> Option<NonNull<u8>> {
        self.inner.lock().addr_of(index)
    }

    /// Frees an object by address.
    pub fn free(&self, ptr: NonNull<u8>) -> bool {
        self.inner.lock().free(ptr)
    }

    /// Frees an object by its global index.
    pub fn free_index(&self, index: u32) {
        self.inner.lock().free_index(index);
    }

    /// Currently allocated object count.
    pub fn used(&self) -> usize {
        self.inner.lock().used()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::test_provider;

    #[test]
    fn capacity_accounts_for_bitmap() {
        test_provider::install();
        let oma = Oma::new(40, 1);
        let cap = oma.arena_capacity() as usize;
        assert!(bitmap_area(cap as u32) + cap * 40 <= frames::rank_bytes(1));
        // Close to the no-bitmap bound.
        assert!(cap >= frames::rank_bytes(1) / 40 - 8);
    }

    #[test]
    fn index_address_bijection() {
        test_provider::install();
        let mut oma = Oma::with_capacity(40, 1, 198);
        let mut seen = Vec::new();
        for _ in 0..500 {
            let (ptr, index) = oma.alloc_indexed().unwrap();
            assert_eq!(oma.addr_of(index), Some(ptr));
            assert_eq!(oma.index_of(ptr), Some(index));
            // Arena/slot decomposition behind completion-by-id.
            let (ai, slot) = (index / 198, index % 198);
            assert!(ai <= 2);
            assert!(slot < 198);
            seen.push(index);
        }
        for index in seen {
            oma.free_index(index);
        }
        assert_eq!(oma.used(), 0);
    }

    #[test]
    fn free_by_address_finds_arena() {
        test_provider::install();
        let mut oma = Oma::new(64, 0);
        let a = oma.alloc().unwrap();
        let b = oma.alloc().unwrap();
        assert!(oma.free(a));
        assert!(oma.free(b));
        // Address outside any arena is rejected.
        let bogus = NonNull::new(0x1000 as *mut u8).unwrap();
        assert!(!oma.free(bogus));
    }

    #[test]
    fn slots_are_reused_after_free() {
        test_provider::install();
        let mut oma = Oma::new(32, 0);
        let (_, first) = oma.alloc_indexed().unwrap();
        oma.free_index(first);
        let (_, second) = oma.alloc_indexed().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        test_provider::install();
        let mut oma = Oma::new(32, 0);
        let (_, index) = oma.alloc_indexed().unwrap();
        oma.free_index(index);
        oma.free_index(index);
    }

    #[test]
    fn safe_oma_shared_access() {
        use std::sync::Arc;
        test_provider::install();
        let oma = Arc::new(SafeOma::new(48, 1));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let oma = Arc::clone(&oma);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    let (_, index) = oma.alloc_indexed().unwrap();
                    oma.free_index(index);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(oma.used(), 0);
    }
}
