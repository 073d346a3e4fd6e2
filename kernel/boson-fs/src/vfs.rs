//! Filesystem registration, the root, and path resolution.
//!
//! Resolution walks component by component from the process root (or a
//! supplied starting directory). Each step consults the lookup cache,
//! then the parent's attached children, and only then the filesystem's
//! `lookup` op; new dentries are linked into the parent and cached.
//! Mount points are followed transparently: the mounted superblock's
//! root stands in for the mount-point dentry.

use alloc::sync::Arc;
use alloc::vec::Vec;

use boson_block::{Drive, Partition};
use boson_core::sync::SpinLock;
use boson_core::{Error, Result, kinfo};

use crate::dentry::Dentry;
use crate::lookup_cache;
use crate::path;
use crate::superblock::Superblock;

/// What a filesystem mounts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    /// Backed by a drive partition.
    Device,
    /// Purely in-memory (tmpfs, devfs, procfs).
    Virtual,
}

/// A registered filesystem driver.
pub struct FileSystem {
    /// Name used by `mount` ("ext2", "tmpfs", …).
    pub name: &'static str,
    /// Device-backed or virtual.
    pub kind: FsKind,
    /// Builds a superblock (with its root dentry bound) for the source.
    pub mount: fn(Option<Arc<Drive>>, Option<Arc<Partition>>) -> Result<Arc<Superblock>>,
    /// Releases a superblock's resources.
    pub unmount: fn(&Arc<Superblock>) -> Result<()>,
}

static FILESYSTEMS: SpinLock<Vec<&'static FileSystem>> = SpinLock::new(Vec::new());

/// Global root dentry.
static ROOT: SpinLock<Option<Arc<Dentry>>> = SpinLock::new(None);

/// Registers a filesystem driver.
///
/// # Errors
///
/// `Exists` when the name is taken.
pub fn register(fs: &'static FileSystem) -> Result<()> {
    let mut list = FILESYSTEMS.lock();
    if list.iter().any(|f| f.name == fs.name) {
        return Err(Error::Exists);
    }
    kinfo!("vfs: registered filesystem '{}'", fs.name);
    list.push(fs);
    Ok(())
}

/// Finds a registered filesystem by name.
#[must_use]
pub fn find(name: &str) -> Option<&'static FileSystem> {
    FILESYSTEMS.lock().iter().find(|f| f.name == name).copied()
}

/// Installs the global root dentry (boot only).
pub fn set_root(root: Arc<Dentry>) {
    *ROOT.lock() = Some(root);
}

/// The global root dentry.
///
/// # Errors
///
/// `NoEnt` before a root is installed.
pub fn root() -> Result<Arc<Dentry>> {
    ROOT.lock().clone().ok_or(Error::NoEnt)
}

/// Mounts a filesystem instance onto an existing dentry.
///
/// # Errors
///
/// `Busy` if the dentry already carries a mount; filesystem `mount`
/// errors pass through.
pub fn mount_at(
    dentry: &Arc<Dentry>,
    fs: &'static FileSystem,
    drive: Option<Arc<Drive>>,
    partition: Option<Arc<Partition>>,
) -> Result<Arc<Superblock>> {
    let sb = (fs.mount)(drive, partition)?;
    dentry.mount(sb.clone())?;
    kinfo!("vfs: mounted {} at '{}'", fs.name, dentry.name());
    Ok(sb)
}

/// Resolves one component under `parent` (which must already be
/// mount-resolved): cache, then attached children, then the filesystem.
fn lookup_child(parent: &Arc<Dentry>, name: &str) -> Result<Arc<Dentry>> {
    if let Some(hit) = lookup_cache::get(parent, name) {
        return Ok(hit);
    }
    if let Some(child) = parent.find_child(name) {
        lookup_cache::insert(parent, &child);
        return Ok(child);
    }
    let child = parent.ops().lookup(parent, name)?;
    parent.add_child(&child);
    lookup_cache::insert(parent, &child);
    Ok(child)
}

/// Resolves a path to a dentry.
///
/// Absolute paths start at the global root; relative ones at `from`
/// (typically the process working directory).
///
/// # Errors
///
/// `NoEnt` for missing components or a missing starting point,
/// `BadDentry` when a non-final component is not a directory.
pub fn resolve(path_str: &str, from: Option<Arc<Dentry>>) -> Result<Arc<Dentry>> {
    let start = if path::is_absolute(path_str) {
        root()?
    } else {
        from.ok_or(Error::NoEnt)?
    };

    let mut current = start.resolve_mount();
    for component in path::components(path_str) {
        match component {
            "." => continue,
            ".." => {
                if let Some(parent) = current.parent() {
                    current = parent.resolve_mount();
                }
                continue;
            }
            _ => {}
        }
        if let Some(inode) = current.inode() {
            if !inode.is_dir() {
                return Err(Error::BadDentry);
            }
        }
        current = lookup_child(&current, component)?.resolve_mount();
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dentry::DentryOps;
    use crate::file::File;
    use crate::inode::{Inode, InodeType};
    use alloc::sync::Weak;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Directory tree driver that counts `lookup` calls and fabricates
    /// any name under 4 levels deep.
    struct CountingFs;

    static LOOKUPS: AtomicUsize = AtomicUsize::new(0);
    static NEXT_INO: AtomicUsize = AtomicUsize::new(100);

    impl DentryOps for CountingFs {
        fn lookup(&self, _parent: &Arc<Dentry>, name: &str) -> Result<Arc<Dentry>> {
            LOOKUPS.fetch_add(1, Ordering::SeqCst);
            if name == "missing" {
                return Err(Error::NoEnt);
            }
            let ino = NEXT_INO.fetch_add(1, Ordering::SeqCst) as u32;
            Ok(Dentry::new(
                name,
                Weak::new(),
                &COUNTING_FS,
                Some(Inode::new(ino, InodeType::Directory, 0o755)),
            ))
        }
        fn open(&self, _dentry: &Arc<Dentry>) -> Result<Arc<File>> {
            Err(Error::BadOperation)
        }
    }
    static COUNTING_FS: CountingFs = CountingFs;

    fn fresh_root() -> Arc<Dentry> {
        crate::test_support::install_frames();
        let ino = NEXT_INO.fetch_add(1, Ordering::SeqCst) as u32;
        Dentry::new(
            "",
            Weak::new(),
            &COUNTING_FS,
            Some(Inode::new(ino, InodeType::Directory, 0o755)),
        )
    }

    #[test]
    fn second_resolution_hits_the_cache() {
        let root = fresh_root();
        let before = LOOKUPS.load(Ordering::SeqCst);

        let first = resolve("a/b/c", Some(root.clone())).unwrap();
        assert_eq!(LOOKUPS.load(Ordering::SeqCst), before + 3);

        let second = resolve("a/b/c", Some(root.clone())).unwrap();
        // All three components served from the cache.
        assert_eq!(LOOKUPS.load(Ordering::SeqCst), before + 3);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn dot_and_dotdot_navigate() {
        let root = fresh_root();
        let a = resolve("a", Some(root.clone())).unwrap();
        let same = resolve("a/./b/..", Some(root.clone())).unwrap();
        assert!(Arc::ptr_eq(&a, &same));
        // `..` at the root stays at the root.
        let still_root = resolve("..", Some(root.clone())).unwrap();
        assert!(Arc::ptr_eq(&still_root, &root));
    }

    #[test]
    fn missing_component_errors() {
        let root = fresh_root();
        assert_eq!(
            resolve("x/missing/y", Some(root)).unwrap_err(),
            Error::NoEnt
        );
    }

    #[test]
    fn mounts_are_followed() {
        let root = fresh_root();
        let mnt = resolve("mnt", Some(root.clone())).unwrap();

        // Build a tiny "filesystem" whose root holds one child.
        let sb = Superblock::new(None, None, 4096);
        let ino = NEXT_INO.fetch_add(1, Ordering::SeqCst) as u32;
        let fs_root = Dentry::new(
            "",
            Arc::downgrade(&sb),
            &COUNTING_FS,
            Some(Inode::new(ino, InodeType::Directory, 0o755)),
        );
        sb.set_root(fs_root.clone());
        mnt.mount(sb).unwrap();

        let via_mount = resolve("mnt", Some(root.clone())).unwrap();
        assert!(Arc::ptr_eq(&via_mount, &fs_root));
        let below = resolve("mnt/data", Some(root.clone())).unwrap();
        assert!(Arc::ptr_eq(&below.parent().unwrap(), &fs_root));

        // Unmount restores the original dentry.
        assert!(mnt.unmount().is_some());
        let plain = resolve("mnt", Some(root)).unwrap();
        assert!(Arc::ptr_eq(&plain, &mnt));
    }

    #[test]
    fn relative_resolution_requires_a_start() {
        assert!(resolve("x", None).is_err());
    }
}
