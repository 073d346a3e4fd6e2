//! Generic cache-backed file I/O.
//!
//! Filesystem drivers implement [`CacheBackend`] — "fill this cache block
//! from disk" — and get offset-based reads and writes, plus the block
//! source used by file-backed mmap, for free. Two tasks missing on the
//! same block race through `insert_or_free`; the loser's pages are
//! returned and both see the winner.

use alloc::sync::Arc;

use boson_core::Result;
use boson_mm::cache::CacheBlock;

use crate::inode::Inode;

/// Filesystem side of the cached I/O helpers.
pub trait CacheBackend: Send + Sync {
    /// Populates `block` (covering `block.index()` of the inode's
    /// contents) from the filesystem. Regions beyond EOF stay zero.
    ///
    /// # Errors
    ///
    /// `IoFailed` for device errors.
    fn read_cache_block(&self, inode: &Inode, block: &CacheBlock) -> Result<()>;
}

/// Gets the cache block covering file block `index`, reading it through
/// the backend on a miss.
///
/// # Errors
///
/// Allocation or backend failures pass through; on failure nothing is
/// inserted, so a later retry re-reads.
pub fn get_cache_block_or_read(
    inode: &Arc<Inode>,
    index: u32,
    backend: &dyn CacheBackend,
) -> Result<Arc<CacheBlock>> {
    if let Some(block) = inode.cache.get(index) {
        return Ok(block);
    }
    let block = inode.cache.create_block(index)?;
    backend.read_cache_block(inode, &block)?;
    Ok(inode.cache.insert_or_free(block))
}

/// Reads up to `buf.len()` bytes at `offset`, clamped to the inode size.
///
/// # Errors
///
/// See [`get_cache_block_or_read`].
pub fn cached_read(
    inode: &Arc<Inode>,
    backend: &dyn CacheBackend,
    offset: u64,
    buf: &mut [u8],
) -> Result<usize> {
    let size = inode.size();
    if offset >= size {
        return Ok(0);
    }
    let want = (buf.len() as u64).min(size - offset) as usize;
    let block_bytes = inode.cache.block_size().bytes();

    let mut done = 0;
    while done < want {
        let pos = offset + done as u64;
        let index = (pos / block_bytes as u64) as u32;
        let inside = (pos % block_bytes as u64) as usize;
        let take = (want - done).min(block_bytes - inside);

        let block = get_cache_block_or_read(inode, index, backend)?;
        buf[done..done + take].copy_from_slice(&block.bytes()[inside..inside + take]);
        done += take;
    }
    Ok(done)
}

/// Writes `buf` at `offset` through the cache, marking dirty quants and
/// growing the inode size past the end of the write.
///
/// # Errors
///
/// See [`get_cache_block_or_read`].
pub fn cached_write(
    inode: &Arc<Inode>,
    backend: &dyn CacheBackend,
    offset: u64,
    buf: &[u8],
) -> Result<usize> {
    let block_bytes = inode.cache.block_size().bytes();

    let mut done = 0;
    while done < buf.len() {
        let pos = offset + done as u64;
        let index = (pos / block_bytes as u64) as u32;
        let inside = (pos % block_bytes as u64) as usize;
        let take = (buf.len() - done).min(block_bytes - inside);

        let block = get_cache_block_or_read(inode, index, backend)?;
        block.write(inside, &buf[done..done + take]);
        done += take;
    }

    let end = offset + buf.len() as u64;
    if end > inode.size() {
        inode.set_size(end);
    }
    Ok(done)
}
