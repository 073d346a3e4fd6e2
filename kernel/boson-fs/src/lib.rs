//! Virtual filesystem core.
//!
//! The VFS tree is superblocks, inodes, dentries, and open files, glued
//! together by ops traits that concrete filesystems implement. Path
//! resolution walks dentries component by component, consulting the
//! process-wide [`lookup_cache`] before calling into the filesystem, and
//! follows mounts transparently.
//!
//! Filesystem drivers get [`cached`] for free: block-cache-backed reads
//! and the page source used by file-backed mmap.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod cached;
pub mod dentry;
pub mod file;
pub mod inode;
pub mod lookup_cache;
pub mod path;
pub mod superblock;
pub mod vfs;

pub use dentry::{Dentry, DentryName, DentryOps};
pub use file::{File, FileOps, OpenFlags};
pub use inode::{Inode, InodeType};
pub use superblock::Superblock;
pub use vfs::{FileSystem, FsKind};

/// Host-side page provider shared by this crate's unit tests.
#[cfg(test)]
pub(crate) mod test_support {
    use core::alloc::Layout;
    use core::ptr::NonNull;

    use boson_mm::frames;

    fn layout(rank: u32) -> Layout {
        Layout::from_size_align(frames::rank_bytes(rank), frames::PAGE_SIZE).unwrap()
    }

    fn host_alloc(rank: u32) -> Option<NonNull<u8>> {
        // SAFETY: layout has non-zero size.
        NonNull::new(unsafe { std::alloc::alloc_zeroed(layout(rank)) })
    }

    fn host_free(base: NonNull<u8>, rank: u32) {
        // SAFETY: `base` came from `host_alloc` with the same rank.
        unsafe { std::alloc::dealloc(base.as_ptr(), layout(rank)) };
    }

    /// Installs the host provider. Idempotent; tests call it first.
    pub fn install_frames() {
        frames::set_provider(host_alloc, host_free);
    }
}
