//! Kernel-wide error type.
//!
//! Every fallible kernel API returns [`Result`]. Errors stay typed all the
//! way up; they are translated to numeric `-E*` values only at the syscall
//! boundary.

use core::fmt;

/// Errors propagated through the kernel core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An allocator (page, slab, or heap) is exhausted.
    NoMemory,
    /// A device reported failure, or a cache-miss read completed with a
    /// failure status.
    IoFailed,
    /// Structural validation of an on-disk or in-memory inode failed.
    BadInode,
    /// Structural validation of a directory entry failed.
    BadDentry,
    /// A filesystem superblock failed validation (bad magic, bad geometry).
    BadSuperblock,
    /// A binary or on-disk structure has an invalid format.
    BadFormat,
    /// A binary targets an ABI the kernel does not support.
    BadAbi,
    /// A dynamic binary names an interpreter that cannot be loaded.
    BadInterpreter,
    /// The named path component does not exist.
    NoEnt,
    /// The target already exists.
    Exists,
    /// The resource is in use and cannot be claimed.
    Busy,
    /// The caller lacks permission for the operation.
    NoAccess,
    /// The object does not support the requested operation.
    BadOperation,
    /// No free minor device number is left for the major.
    DevMinorLimit,
    /// No free major device number is left.
    DevMajorLimit,
    /// A fixed-capacity slot table is full.
    MaxSize,
    /// A user pointer references unmapped or foreign memory.
    SegFault,
    /// The caller passed invalid arguments.
    InvalidArgs,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoMemory => "out of memory",
            Self::IoFailed => "I/O failed",
            Self::BadInode => "bad inode",
            Self::BadDentry => "bad directory entry",
            Self::BadSuperblock => "bad superblock",
            Self::BadFormat => "bad format",
            Self::BadAbi => "bad ABI",
            Self::BadInterpreter => "bad interpreter",
            Self::NoEnt => "no such entry",
            Self::Exists => "already exists",
            Self::Busy => "resource busy",
            Self::NoAccess => "access denied",
            Self::BadOperation => "operation not supported",
            Self::DevMinorLimit => "minor device numbers exhausted",
            Self::DevMajorLimit => "major device numbers exhausted",
            Self::MaxSize => "slot table full",
            Self::SegFault => "segmentation fault",
            Self::InvalidArgs => "invalid arguments",
        };
        f.write_str(s)
    }
}

/// Result alias used across the kernel.
pub type Result<T> = core::result::Result<T, Error>;
