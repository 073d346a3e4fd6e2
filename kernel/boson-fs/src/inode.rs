//! Inodes.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::any::Any;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use boson_core::sync::SpinLock;
use boson_mm::cache::{BlockSize, CacheController};

/// Filesystem object type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeType {
    /// Plain data file.
    RegularFile,
    /// Directory.
    Directory,
    /// Character device node.
    CharDevice,
    /// Block device node.
    BlockDevice,
    /// Named pipe.
    Fifo,
    /// Unix-domain socket.
    Socket,
    /// Symbolic link.
    SymbolicLink,
    /// Anything the filesystem could not classify.
    Unknown,
}

/// In-memory filesystem object metadata.
///
/// Reference counting is the surrounding `Arc`; the invariant that an
/// inode outlives every dentry referring to it falls out of each dentry
/// holding a strong reference.
pub struct Inode {
    /// Filesystem-local index (e.g. the ext2 inode number).
    pub index: u32,
    /// Object type.
    pub typ: InodeType,
    /// Permission bits (low 12 bits of the POSIX mode).
    pub mode: u16,
    /// Size in bytes.
    pub size: AtomicU64,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Hard-link count.
    pub links: AtomicU32,
    /// Access / modification / change times (Unix seconds).
    pub atime: AtomicU64,
    /// See `atime`.
    pub mtime: AtomicU64,
    /// See `atime`.
    pub ctime: AtomicU64,
    /// Page cache for this inode's contents (file-backed mmap, cached
    /// reads). Page-sized blocks so single pages can map into user space.
    pub cache: CacheController,
    /// Filesystem-private payload.
    pub fs_data: SpinLock<Option<Box<dyn Any + Send>>>,
}

impl Inode {
    /// Creates an inode with zeroed metadata.
    #[must_use]
    pub fn new(index: u32, typ: InodeType, mode: u16) -> Arc<Self> {
        Arc::new(Self {
            index,
            typ,
            mode,
            size: AtomicU64::new(0),
            uid: 0,
            gid: 0,
            links: AtomicU32::new(1),
            atime: AtomicU64::new(0),
            mtime: AtomicU64::new(0),
            ctime: AtomicU64::new(0),
            cache: CacheController::new(BlockSize::Small),
            fs_data: SpinLock::new(None),
        })
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Updates the size.
    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    /// Whether this inode is a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.typ == InodeType::Directory
    }

    /// Stores a filesystem-private payload.
    pub fn set_fs_data(&self, data: Box<dyn Any + Send>) {
        *self.fs_data.lock() = Some(data);
    }

    /// Runs a closure over the downcast filesystem payload.
    pub fn with_fs_data<T: 'static, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let guard = self.fs_data.lock();
        guard.as_ref()?.downcast_ref::<T>().map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_roundtrip() {
        crate::test_support::install_frames();
        let inode = Inode::new(2, InodeType::RegularFile, 0o644);
        assert_eq!(inode.size(), 0);
        inode.set_size(4096);
        assert_eq!(inode.size(), 4096);
        assert!(!inode.is_dir());
    }

    #[test]
    fn fs_data_downcasts() {
        crate::test_support::install_frames();
        let inode = Inode::new(3, InodeType::Directory, 0o755);
        inode.set_fs_data(Box::new(41u64));
        assert_eq!(inode.with_fs_data::<u64, _>(|v| *v + 1), Some(42));
        assert_eq!(inode.with_fs_data::<u32, _>(|v| *v), None);
    }
}
