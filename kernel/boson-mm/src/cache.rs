//! Cache-block layer.
//!
//! A [`CacheController`] maps 32-bit block indices to reference-counted
//! [`CacheBlock`]s. Readers race on misses: both allocate a candidate
//! block, and [`CacheController::insert_or_free`] picks the winner while
//! the loser's pages are returned. Dirtiness is tracked per *quant*
//! (1/64th of the block) so partial write-back stays cheap.
//!
//! Dropping the last outside reference does not free a block; it merely
//! becomes eligible for [`CacheController::evict`], which runs the
//! controller's write-back hook on dirty blocks first. The default hook
//! succeeds without writing, which is what read-only filesystems want.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use boson_core::Result;
use boson_core::sync::SpinLock;

use crate::frames;

/// Dirty-tracking quants per block.
pub const BLOCK_QUANTS: usize = 64;

/// Cache block size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSize {
    /// One page (4 KiB).
    Small,
    /// Four pages (16 KiB).
    Medium,
    /// Sixteen pages (64 KiB).
    Large,
}

impl BlockSize {
    /// Page rank backing this size class.
    #[must_use]
    pub const fn rank(self) -> u32 {
        match self {
            Self::Small => 0,
            Self::Medium => 2,
            Self::Large => 4,
        }
    }

    /// Block size in bytes.
    #[must_use]
    pub const fn bytes(self) -> usize {
        frames::PAGE_SIZE << self.rank()
    }

    /// Bytes covered by one dirty quant.
    #[must_use]
    pub const fn quant_bytes(self) -> usize {
        self.bytes() / BLOCK_QUANTS
    }

    /// Smallest class covering `bytes`.
    #[must_use]
    pub fn covering(bytes: usize) -> Self {
        if bytes <= Self::Small.bytes() {
            Self::Small
        } else if bytes <= Self::Medium.bytes() {
            Self::Medium
        } else {
            Self::Large
        }
    }
}

/// A fixed-size cached range of a file or block device.
///
/// The payload is raw page memory; concurrent readers and writers of
/// disjoint ranges coordinate above this layer (file offsets never alias).
pub struct CacheBlock {
    base: NonNull<u8>,
    size: BlockSize,
    index: u32,
    dirty: AtomicU64,
}

// SAFETY: The payload is plain bytes; range coordination is the caller's
// contract (see struct docs).
unsafe impl Send for CacheBlock {}
// SAFETY: As above.
unsafe impl Sync for CacheBlock {}

impl CacheBlock {
    /// Logical block index within the owning controller.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Size class of this block.
    #[must_use]
    pub fn size(&self) -> BlockSize {
        self.size
    }

    /// Base address of the block payload.
    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Read-only view of the payload.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: `base` covers `size.bytes()` valid bytes for self's life.
        unsafe { core::slice::from_raw_parts(self.base.as_ptr(), self.size.bytes()) }
    }

    /// Copies `src` into the block at `offset` and marks the range dirty.
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the block.
    pub fn write(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.size.bytes());
        // SAFETY: Range checked above; byte-range exclusivity is the
        // caller's contract.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), self.base.as_ptr().add(offset), src.len());
        }
        self.mark_dirty(offset, src.len());
    }

    /// Fills the whole payload from `src` without marking dirty.
    ///
    /// Used by cache-miss reads that populate a block from the device.
    ///
    /// # Panics
    ///
    /// Panics if `src` is longer than the block.
    pub fn fill(&self, src: &[u8]) {
        assert!(src.len() <= self.size.bytes());
        // SAFETY: Range checked above; the block is not yet shared while
        // being populated.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), self.base.as_ptr(), src.len());
        }
    }

    /// Zeroes the whole payload without marking dirty (fresh blocks of
    /// memory-only filesystems, sparse file regions).
    pub fn zero(&self) {
        // SAFETY: The payload covers `size.bytes()` writable bytes.
        unsafe { core::ptr::write_bytes(self.base.as_ptr(), 0, self.size.bytes()) };
    }

    /// Copies `src` to `offset` without marking dirty (cache-miss
    /// population from the device).
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the block.
    pub fn fill_at(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.size.bytes());
        // SAFETY: Range checked above; the block is being populated
        // before it is shared.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), self.base.as_ptr().add(offset), src.len());
        }
    }

    /// Marks `[offset, offset + len)` dirty at quant granularity.
    pub fn mark_dirty(&self, offset: usize, len: usize) {
        if len == 0 {
            return;
        }
        let quant = self.size.quant_bytes();
        let first = offset / quant;
        let last = (offset + len - 1) / quant;
        let mut mask = 0u64;
        for q in first..=last.min(BLOCK_QUANTS - 1) {
            mask |= 1 << q;
        }
        self.dirty.fetch_or(mask, Ordering::Release);
    }

    /// Returns whether any quant is dirty.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire) != 0
    }

    /// Returns and clears the dirty map.
    #[must_use]
    pub fn take_dirty(&self) -> u64 {
        self.dirty.swap(0, Ordering::AcqRel)
    }

    /// Address of the `page`-th page inside the block (for mmap install).
    ///
    /// # Panics
    ///
    /// Panics if `page` is beyond the block.
    #[must_use]
    pub fn page_at(&self, page: usize) -> NonNull<u8> {
        assert!(page < (1usize << self.size.rank()));
        // SAFETY: Offset checked against the block extent.
        NonNull::new(unsafe { self.base.as_ptr().add(page * frames::PAGE_SIZE) })
            .expect("block base is non-null")
    }
}

impl Drop for CacheBlock {
    fn drop(&mut self) {
        frames::free_pages(self.base, self.size.rank());
    }
}

/// Write-back hook invoked on dirty blocks before eviction.
pub type WritebackFn = fn(&CacheBlock) -> Result<()>;

fn writeback_noop(_block: &CacheBlock) -> Result<()> {
    Ok(())
}

/// Maps block indices to cached blocks for one device or file.
pub struct CacheController {
    size: BlockSize,
    blocks: SpinLock<BTreeMap<u32, Arc<CacheBlock>>>,
    writeback: AtomicPtr<()>,
}

impl CacheController {
    /// Creates an empty controller for the given block size class.
    #[must_use]
    pub fn new(size: BlockSize) -> Self {
        Self {
            size,
            blocks: SpinLock::new(BTreeMap::new()),
            writeback: AtomicPtr::new(writeback_noop as *mut ()),
        }
    }

    /// Block size class served by this controller.
    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.size
    }

    /// Installs a write-back hook replacing the succeed-without-writing
    /// default.
    pub fn set_writeback(&self, f: WritebackFn) {
        self.writeback.store(f as *mut (), Ordering::Release);
    }

    fn run_writeback(&self, block: &CacheBlock) -> Result<()> {
        let ptr = self.writeback.load(Ordering::Acquire);
        // SAFETY: The slot only ever holds a valid `WritebackFn`.
        let f: WritebackFn = unsafe { core::mem::transmute(ptr) };
        f(block)
    }

    /// Non-blocking lookup; bumps the reference on a hit.
    #[must_use]
    pub fn get(&self, index: u32) -> Option<Arc<CacheBlock>> {
        self.blocks.lock().get(&index).cloned()
    }

    /// Allocates a detached block for `index`.
    ///
    /// The block is not yet visible; populate it, then race it in with
    /// [`CacheController::insert_or_free`].
    ///
    /// # Errors
    ///
    /// Returns [`boson_core::Error::NoMemory`] when pages are exhausted.
    pub fn create_block(&self, index: u32) -> Result<Arc<CacheBlock>> {
        let base = frames::alloc_pages(self.size.rank())?;
        Ok(Arc::new(CacheBlock {
            base,
            size: self.size,
            index,
            dirty: AtomicU64::new(0),
        }))
    }

    /// Atomically inserts `block`, or returns the already-present winner.
    ///
    /// The losing block (the argument, when an entry already exists) is
    /// dropped, returning its pages.
    #[must_use]
    pub fn insert_or_free(&self, block: Arc<CacheBlock>) -> Arc<CacheBlock> {
        let mut blocks = self.blocks.lock();
        match blocks.get(&block.index) {
            Some(winner) => winner.clone(),
            None => {
                blocks.insert(block.index, block.clone());
                block
            }
        }
    }

    /// Number of cached blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Returns whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }

    /// Writes back every dirty block without evicting anything.
    ///
    /// # Errors
    ///
    /// Stops at the first hook failure.
    pub fn flush(&self) -> Result<()> {
        let snapshot: alloc::vec::Vec<Arc<CacheBlock>> =
            self.blocks.lock().values().cloned().collect();
        for block in snapshot {
            if block.is_dirty() {
                self.run_writeback(&block)?;
            }
        }
        Ok(())
    }

    /// Evicts every block with no outside references.
    ///
    /// Dirty blocks are written back first; a hook failure keeps the block
    /// cached and aborts the sweep. Returns the number of evicted blocks.
    ///
    /// # Errors
    ///
    /// Propagates the first write-back failure.
    pub fn evict(&self) -> Result<usize> {
        let mut evicted = 0;
        let mut blocks = self.blocks.lock();
        let candidates: alloc::vec::Vec<u32> = blocks
            .iter()
            .filter(|(_, b)| Arc::strong_count(b) == 1)
            .map(|(&i, _)| i)
            .collect();
        for index in candidates {
            let block = blocks.get(&index).expect("candidate still cached").clone();
            if block.is_dirty() {
                self.run_writeback(&block)?;
                let _ = block.take_dirty();
            }
            drop(block);
            blocks.remove(&index);
            evicted += 1;
        }
        Ok(evicted)
    }
}
