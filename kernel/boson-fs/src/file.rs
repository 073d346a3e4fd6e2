//! Open file instances.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use boson_core::{Error, Result};
use boson_mm::cache::CacheBlock;

use crate::dentry::Dentry;

bitflags! {
    /// Open flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Readable.
        const READ     = 1 << 0;
        /// Writable.
        const WRITE    = 1 << 1;
        /// Create if absent.
        const CREATE   = 1 << 2;
        /// Truncate on open.
        const TRUNCATE = 1 << 3;
    }
}

/// Per-filesystem file operations.
pub trait FileOps: Send + Sync {
    /// Reads at the file's byte `offset` into `buf`; returns bytes read.
    ///
    /// # Errors
    ///
    /// Filesystem-specific; `IoFailed` for device errors.
    fn read(&self, file: &File, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Writes at the file's byte `offset`; returns bytes written.
    ///
    /// # Errors
    ///
    /// `BadOperation` for read-only files.
    fn write(&self, _file: &File, _offset: u64, _buf: &[u8]) -> Result<usize> {
        Err(Error::BadOperation)
    }

    /// Obtains the cache block backing page `block_index` for file-backed
    /// mmap; the fault handler maps single pages out of it.
    ///
    /// # Errors
    ///
    /// `BadOperation` when the file cannot be mapped.
    fn mmap_block(&self, _file: &File, _block_index: u32) -> Result<Arc<CacheBlock>> {
        Err(Error::BadOperation)
    }

    /// Device-specific control.
    ///
    /// # Errors
    ///
    /// `BadOperation` when unsupported.
    fn ioctl(&self, _file: &File, _cmd: u32, _arg: usize) -> Result<usize> {
        Err(Error::BadOperation)
    }
}

/// An open file: a dentry, an ops vtable, and a byte offset.
///
/// Multiple files may alias one dentry; the reference count is the
/// surrounding `Arc`.
pub struct File {
    /// The opened entry.
    pub dentry: Arc<Dentry>,
    ops: &'static dyn FileOps,
    /// Open mode.
    pub flags: OpenFlags,
    offset: AtomicU64,
}

impl core::fmt::Debug for File {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("File").field("flags", &self.flags).finish_non_exhaustive()
    }
}

impl File {
    /// Creates an open file at offset 0.
    #[must_use]
    pub fn new(dentry: Arc<Dentry>, ops: &'static dyn FileOps, flags: OpenFlags) -> Arc<Self> {
        Arc::new(Self {
            dentry,
            ops,
            flags,
            offset: AtomicU64::new(0),
        })
    }

    /// Current byte offset.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    /// Moves the offset to an absolute position.
    pub fn seek(&self, offset: u64) {
        self.offset.store(offset, Ordering::Release);
    }

    /// Reads from the current offset, advancing it.
    ///
    /// # Errors
    ///
    /// `NoAccess` if the file is not open for reading.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if !self.flags.contains(OpenFlags::READ) {
            return Err(Error::NoAccess);
        }
        let offset = self.offset.load(Ordering::Acquire);
        let n = self.ops.read(self, offset, buf)?;
        self.offset.fetch_add(n as u64, Ordering::AcqRel);
        Ok(n)
    }

    /// Writes at the current offset, advancing it.
    ///
    /// # Errors
    ///
    /// `NoAccess` if the file is not open for writing.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        if !self.flags.contains(OpenFlags::WRITE) {
            return Err(Error::NoAccess);
        }
        let offset = self.offset.load(Ordering::Acquire);
        let n = self.ops.write(self, offset, buf)?;
        self.offset.fetch_add(n as u64, Ordering::AcqRel);
        Ok(n)
    }

    /// Positional read; does not move the offset.
    ///
    /// # Errors
    ///
    /// See [`File::read`].
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.ops.read(self, offset, buf)
    }

    /// Positional write; does not move the offset.
    ///
    /// # Errors
    ///
    /// See [`File::write`].
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        self.ops.write(self, offset, buf)
    }

    /// Cache block for mmap page population.
    ///
    /// # Errors
    ///
    /// See [`FileOps::mmap_block`].
    pub fn mmap_block(&self, block_index: u32) -> Result<Arc<CacheBlock>> {
        self.ops.mmap_block(self, block_index)
    }

    /// Device control.
    ///
    /// # Errors
    ///
    /// See [`FileOps::ioctl`].
    pub fn ioctl(&self, cmd: u32, arg: usize) -> Result<usize> {
        self.ops.ioctl(self, cmd, arg)
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.dentry.ops().close(self);
    }
}
