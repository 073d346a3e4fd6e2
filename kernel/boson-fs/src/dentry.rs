//! Directory entries.
//!
//! Dentries form the name tree: a parent owns a strong reference to each
//! attached child, children keep a weak back-pointer, so dropping a
//! subtree from its parent collects it. Names up to 31 bytes are stored
//! inline; longer ones go to the heap.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use boson_core::sync::SpinLock;
use boson_core::{Error, Result};

use crate::file::File;
use crate::inode::Inode;
use crate::lookup_cache;
use crate::superblock::Superblock;

/// Longest name stored without heap allocation.
const INLINE_NAME_MAX: usize = 31;

/// A dentry name, inline for the common short case.
pub enum DentryName {
    /// Short name, stored in place.
    Inline {
        /// Used bytes of `buf`.
        len: u8,
        /// Name bytes.
        buf: [u8; INLINE_NAME_MAX],
    },
    /// Name longer than [`INLINE_NAME_MAX`] bytes.
    Heap(String),
}

impl DentryName {
    /// Builds a name, choosing the storage by length.
    #[must_use]
    pub fn new(name: &str) -> Self {
        if name.len() <= INLINE_NAME_MAX {
            let mut buf = [0u8; INLINE_NAME_MAX];
            buf[..name.len()].copy_from_slice(name.as_bytes());
            Self::Inline {
                len: name.len() as u8,
                buf,
            }
        } else {
            Self::Heap(String::from(name))
        }
    }

    /// The name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Inline { len, buf } => {
                // SAFETY: Constructed from a valid &str prefix.
                unsafe { core::str::from_utf8_unchecked(&buf[..*len as usize]) }
            }
            Self::Heap(s) => s.as_str(),
        }
    }
}

/// Per-filesystem dentry operations.
///
/// Everything except `lookup` and `open` has a default for filesystems
/// that do not support it.
pub trait DentryOps: Send + Sync {
    /// Finds `name` under `parent`, producing a fresh unlinked dentry.
    ///
    /// # Errors
    ///
    /// `NoEnt` if the name does not exist.
    fn lookup(&self, parent: &Arc<Dentry>, name: &str) -> Result<Arc<Dentry>>;

    /// Creates a directory.
    ///
    /// # Errors
    ///
    /// `BadOperation` for read-only filesystems.
    fn make_directory(&self, _parent: &Arc<Dentry>, _name: &str) -> Result<Arc<Dentry>> {
        Err(Error::BadOperation)
    }

    /// Creates a regular file.
    ///
    /// # Errors
    ///
    /// `BadOperation` for read-only filesystems.
    fn create_file(&self, _parent: &Arc<Dentry>, _name: &str) -> Result<Arc<Dentry>> {
        Err(Error::BadOperation)
    }

    /// Opens the dentry, producing a file instance.
    ///
    /// # Errors
    ///
    /// `BadOperation` if the object cannot be opened.
    fn open(&self, dentry: &Arc<Dentry>) -> Result<Arc<File>>;

    /// Releases filesystem state held by an open file.
    fn close(&self, _file: &File) {}

    /// Tears down filesystem-private inode state when the inode goes.
    fn deinit_inode(&self, _inode: &Inode) {}
}

/// A name in the VFS tree, binding a parent, an inode, and children.
pub struct Dentry {
    name: DentryName,
    parent: SpinLock<Weak<Dentry>>,
    superblock: Weak<Superblock>,
    ops: &'static dyn DentryOps,
    inode: SpinLock<Option<Arc<Inode>>>,
    children: SpinLock<Vec<Arc<Dentry>>>,
    mounted: SpinLock<Option<Arc<Superblock>>>,
}

impl core::fmt::Debug for Dentry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dentry").field("name", &self.name()).finish_non_exhaustive()
    }
}

impl Dentry {
    /// Creates a detached dentry.
    #[must_use]
    pub fn new(
        name: &str,
        superblock: Weak<Superblock>,
        ops: &'static dyn DentryOps,
        inode: Option<Arc<Inode>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: DentryName::new(name),
            parent: SpinLock::new(Weak::new()),
            superblock,
            ops,
            inode: SpinLock::new(inode),
            children: SpinLock::new(Vec::new()),
            mounted: SpinLock::new(None),
        })
    }

    /// Entry name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Filesystem operations vtable.
    #[must_use]
    pub fn ops(&self) -> &'static dyn DentryOps {
        self.ops
    }

    /// The owning superblock, while mounted.
    #[must_use]
    pub fn superblock(&self) -> Option<Arc<Superblock>> {
        self.superblock.upgrade()
    }

    /// Parent dentry; `None` for a root or detached entry.
    #[must_use]
    pub fn parent(&self) -> Option<Arc<Dentry>> {
        self.parent.lock().upgrade()
    }

    /// Bound inode.
    #[must_use]
    pub fn inode(&self) -> Option<Arc<Inode>> {
        self.inode.lock().clone()
    }

    /// Binds an inode.
    pub fn set_inode(&self, inode: Arc<Inode>) {
        *self.inode.lock() = Some(inode);
    }

    /// Attaches `child` under `self`: the parent takes a strong
    /// reference, the child a weak back-pointer.
    pub fn add_child(self: &Arc<Self>, child: &Arc<Dentry>) {
        *child.parent.lock() = Arc::downgrade(self);
        self.children.lock().push(child.clone());
    }

    /// Looks for an already-attached child by name.
    #[must_use]
    pub fn find_child(&self, name: &str) -> Option<Arc<Dentry>> {
        self.children
            .lock()
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// Detaches a child by name; also drops it from the lookup cache.
    /// Dropping the returned reference collects the subtree.
    pub fn remove_child(&self, name: &str) -> Option<Arc<Dentry>> {
        let mut children = self.children.lock();
        let pos = children.iter().position(|c| c.name() == name)?;
        let child = children.remove(pos);
        drop(children);
        lookup_cache::remove(self, name);
        *child.parent.lock() = Weak::new();
        Some(child)
    }

    /// Snapshot of the attached children.
    #[must_use]
    pub fn children(&self) -> Vec<Arc<Dentry>> {
        self.children.lock().clone()
    }

    /// Attaches a mounted superblock's root over this dentry.
    ///
    /// # Errors
    ///
    /// `Busy` if something is already mounted here.
    pub fn mount(self: &Arc<Self>, sb: Arc<Superblock>) -> Result<()> {
        let mut mounted = self.mounted.lock();
        if mounted.is_some() {
            return Err(Error::Busy);
        }
        *sb.mounted_on.lock() = Some(Arc::downgrade(self));
        *mounted = Some(sb);
        Ok(())
    }

    /// Detaches the mounted superblock, returning it.
    pub fn unmount(&self) -> Option<Arc<Superblock>> {
        let sb = self.mounted.lock().take()?;
        *sb.mounted_on.lock() = None;
        Some(sb)
    }

    /// Follows a mount: the mounted filesystem's root stands in for the
    /// mount-point dentry during traversal.
    #[must_use]
    pub fn resolve_mount(self: &Arc<Self>) -> Arc<Dentry> {
        match self.mounted.lock().as_ref() {
            Some(sb) => sb.root(),
            None => self.clone(),
        }
    }

    /// Opens this dentry via its ops.
    ///
    /// # Errors
    ///
    /// Propagates the filesystem's `open`.
    pub fn open(self: &Arc<Self>) -> Result<Arc<File>> {
        self.ops.open(self)
    }
}

impl Drop for Dentry {
    fn drop(&mut self) {
        if let Some(inode) = self.inode.lock().take() {
            self.ops.deinit_inode(&inode);
        }
    }
}
