//! Superblocks: in-memory mount records.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use core::any::Any;

use boson_block::{Drive, Partition};
use boson_core::sync::SpinLock;

use crate::dentry::Dentry;

/// One mounted filesystem instance.
pub struct Superblock {
    /// Backing drive, `None` for virtual filesystems.
    pub drive: Option<Arc<Drive>>,
    /// Partition within the drive.
    pub partition: Option<Arc<Partition>>,
    /// Byte offset of the partition start.
    pub part_offset: u64,
    /// Filesystem block size; a power of two.
    pub block_size: u32,
    /// log2 of `block_size`.
    pub block_shift: u32,
    /// Root dentry, set once right after construction.
    root: SpinLock<Option<Arc<Dentry>>>,
    /// The dentry this filesystem is mounted on.
    pub mounted_on: SpinLock<Option<Weak<Dentry>>>,
    /// Filesystem-private payload.
    pub fs_data: SpinLock<Option<Box<dyn Any + Send>>>,
}

impl core::fmt::Debug for Superblock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Superblock")
            .field("part_offset", &self.part_offset)
            .field("block_size", &self.block_size)
            .field("block_shift", &self.block_shift)
            .finish_non_exhaustive()
    }
}

impl Superblock {
    /// Creates a superblock without a root (bind the root right after).
    #[must_use]
    pub fn new(
        drive: Option<Arc<Drive>>,
        partition: Option<Arc<Partition>>,
        block_size: u32,
    ) -> Arc<Self> {
        assert!(block_size.is_power_of_two());
        let part_offset = match (&drive, &partition) {
            (Some(d), Some(p)) => p.byte_offset(d.lba_shift()),
            _ => 0,
        };
        Arc::new(Self {
            drive,
            partition,
            part_offset,
            block_size,
            block_shift: block_size.trailing_zeros(),
            root: SpinLock::new(None),
            mounted_on: SpinLock::new(None),
            fs_data: SpinLock::new(None),
        })
    }

    /// Binds the root dentry.
    ///
    /// # Panics
    ///
    /// Panics on a second bind.
    pub fn set_root(&self, root: Arc<Dentry>) {
        let mut slot = self.root.lock();
        assert!(slot.is_none(), "superblock root bound twice");
        *slot = Some(root);
    }

    /// Root dentry.
    ///
    /// # Panics
    ///
    /// Panics if the filesystem's `mount` never bound a root.
    #[must_use]
    pub fn root(&self) -> Arc<Dentry> {
        self.root.lock().clone().expect("superblock has no root")
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
