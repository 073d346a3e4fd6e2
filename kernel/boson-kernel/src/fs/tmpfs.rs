//! tmpfs — RAM-backed filesystem.
//!
//! Everything lives in the VFS structures themselves: dentries form the
//! tree, file contents live in the inodes' cache blocks and are never
//! evicted. `lookup` therefore only ever consults the attached children;
//! a miss is a genuine `NoEnt`.

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicU32, Ordering};

use boson_core::{Error, Result};
use boson_fs::cached::{self, CacheBackend};
use boson_fs::dentry::{Dentry, DentryOps};
use boson_fs::file::{File, FileOps, OpenFlags};
use boson_fs::inode::{Inode, InodeType};
use boson_fs::superblock::Superblock;
use boson_fs::vfs::{FileSystem, FsKind};
use boson_mm::cache::CacheBlock;

use boson_block::{Drive, Partition};

/// FS-local inode index allocator (shared by all tmpfs instances).
static NEXT_INODE: AtomicU32 = AtomicU32::new(1);

fn next_inode() -> u32 {
    NEXT_INODE.fetch_add(1, Ordering::Relaxed)
}

/// Memory-only backend: fresh blocks are zeroed, nothing hits a device.
struct ZeroBackend;

impl CacheBackend for ZeroBackend {
    fn read_cache_block(&self, _inode: &Inode, block: &CacheBlock) -> Result<()> {
        block.zero();
        Ok(())
    }
}

static ZERO_BACKEND: ZeroBackend = ZeroBackend;

// ---------------------------------------------------------------------------
// File ops
// ---------------------------------------------------------------------------

struct TmpfsFileOps;

impl FileOps for TmpfsFileOps {
    fn read(&self, file: &File, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let inode = file.dentry.inode().ok_or(Error::BadInode)?;
        cached::cached_read(&inode, &ZERO_BACKEND, offset, buf)
    }

    fn write(&self, file: &File, offset: u64, buf: &[u8]) -> Result<usize> {
        let inode = file.dentry.inode().ok_or(Error::BadInode)?;
        cached::cached_write(&inode, &ZERO_BACKEND, offset, buf)
    }

    fn mmap_block(&self, file: &File, block_index: u32) -> Result<Arc<CacheBlock>> {
        let inode = file.dentry.inode().ok_or(Error::BadInode)?;
        cached::get_cache_block_or_read(&inode, block_index, &ZERO_BACKEND)
    }
}

static TMPFS_FILE_OPS: TmpfsFileOps = TmpfsFileOps;

// ---------------------------------------------------------------------------
// Dentry ops
// ---------------------------------------------------------------------------

struct TmpfsDentryOps;

impl DentryOps for TmpfsDentryOps {
    fn lookup(&self, _parent: &Arc<Dentry>, _name: &str) -> Result<Arc<Dentry>> {
        // The tree is fully materialized; anything unattached is absent.
        Err(Error::NoEnt)
    }

    fn make_directory(&self, parent: &Arc<Dentry>, name: &str) -> Result<Arc<Dentry>> {
        if parent.find_child(name).is_some() {
            return Err(Error::Exists);
        }
        let inode = Inode::new(next_inode(), InodeType::Directory, 0o755);
        let sb = parent
            .superblock()
            .map_or_else(Weak::new, |sb| Arc::downgrade(&sb));
        let child = Dentry::new(name, sb, &TMPFS_DENTRY_OPS, Some(inode));
        parent.add_child(&child);
        Ok(child)
    }

    fn create_file(&self, parent: &Arc<Dentry>, name: &str) -> Result<Arc<Dentry>> {
        if parent.find_child(name).is_some() {
            return Err(Error::Exists);
        }
        let inode = Inode::new(next_inode(), InodeType::RegularFile, 0o644);
        let sb = parent
            .superblock()
            .map_or_else(Weak::new, |sb| Arc::downgrade(&sb));
        let child = Dentry::new(name, sb, &TMPFS_DENTRY_OPS, Some(inode));
        parent.add_child(&child);
        Ok(child)
    }

    fn open(&self, dentry: &Arc<Dentry>) -> Result<Arc<File>> {
        let inode = dentry.inode().ok_or(Error::BadInode)?;
        if inode.is_dir() {
            return Err(Error::BadOperation);
        }
        Ok(File::new(
            dentry.clone(),
            &TMPFS_FILE_OPS,
            OpenFlags::READ | OpenFlags::WRITE,
        ))
    }
}

static TMPFS_DENTRY_OPS: TmpfsDentryOps = TmpfsDentryOps;

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

fn tmpfs_mount(
    _drive: Option<Arc<Drive>>,
    _partition: Option<Arc<Partition>>,
) -> Result<Arc<Superblock>> {
    let sb = Superblock::new(None, None, boson_mm::PAGE_SIZE as u32);
    let root_inode = Inode::new(next_inode(), InodeType::Directory, 0o755);
    let root = Dentry::new("", Arc::downgrade(&sb), &TMPFS_DENTRY_OPS, Some(root_inode));
    sb.set_root(root);
    Ok(sb)
}

fn tmpfs_unmount(_sb: &Arc<Superblock>) -> Result<()> {
    Ok(())
}

/// The registrable tmpfs driver.
pub static TMPFS: FileSystem = FileSystem {
    name: "tmpfs",
    kind: FsKind::Virtual,
    mount: tmpfs_mount,
    unmount: tmpfs_unmount,
};

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_root() -> Arc<Dentry> {
        crate::test_support::install_frames();
        tmpfs_mount(None, None).unwrap().root()
    }

    #[test]
    fn create_write_read_roundtrip() {
        let root = fresh_root();
        let file_dentry = root.ops().create_file(&root, "motd").unwrap();
        let file = file_dentry.open().unwrap();

        assert_eq!(file.write(b"welcome to boson\n").unwrap(), 17);
        let inode = file_dentry.inode().unwrap();
        assert_eq!(inode.size(), 17);

        let reader = file_dentry.open().unwrap();
        let mut buf = [0u8; 32];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"welcome to boson\n");
    }

    #[test]
    fn directories_nest_and_reject_duplicates() {
        let root = fresh_root();
        let etc = root.ops().make_directory(&root, "etc").unwrap();
        assert!(etc.inode().unwrap().is_dir());
        assert_eq!(
            root.ops().make_directory(&root, "etc").unwrap_err(),
            Error::Exists
        );
        let sub = etc.ops().make_directory(&etc, "rc.d").unwrap();
        assert!(Arc::ptr_eq(&sub.parent().unwrap(), &etc));
    }

    #[test]
    fn lookup_of_absent_names_fails() {
        let root = fresh_root();
        assert_eq!(
            root.ops().lookup(&root, "nothing").unwrap_err(),
            Error::NoEnt
        );
    }

    #[test]
    fn directories_cannot_be_opened_as_files() {
        let root = fresh_root();
        let dir = root.ops().make_directory(&root, "d").unwrap();
        assert_eq!(dir.open().unwrap_err(), Error::BadOperation);
    }

    #[test]
    fn sparse_reads_come_back_zeroed() {
        let root = fresh_root();
        let dentry = root.ops().create_file(&root, "sparse").unwrap();
        let file = dentry.open().unwrap();
        file.write_at(10_000, b"tail").unwrap();
        let mut buf = [0xFFu8; 16];
        assert_eq!(file.read_at(0, &mut buf).unwrap(), 16);
        assert_eq!(buf, [0u8; 16]);
    }
}
