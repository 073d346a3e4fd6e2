//! Linux errno constants and the kernel-error translation table.
//!
//! Kernel errors stay typed until the syscall boundary; this is the one
//! place they turn into numbers.

use boson_core::Error;

/// Operation not permitted.
pub const EPERM: i32 = 1;
/// No such file or directory.
pub const ENOENT: i32 = 2;
/// I/O error.
pub const EIO: i32 = 5;
/// Exec format error.
pub const ENOEXEC: i32 = 8;
/// Bad file descriptor.
pub const EBADF: i32 = 9;
/// Out of memory.
pub const ENOMEM: i32 = 12;
/// Permission denied.
pub const EACCES: i32 = 13;
/// Bad address.
pub const EFAULT: i32 = 14;
/// Device or resource busy.
pub const EBUSY: i32 = 16;
/// File exists.
pub const EEXIST: i32 = 17;
/// No such device.
pub const ENODEV: i32 = 19;
/// Invalid argument.
pub const EINVAL: i32 = 22;
/// Too many open files.
pub const EMFILE: i32 = 24;
/// Function not implemented.
pub const ENOSYS: i32 = 38;
/// Operation not supported.
pub const EOPNOTSUPP: i32 = 95;

/// Maps a kernel error to its errno.
#[must_use]
pub fn errno_of(err: Error) -> i32 {
    match err {
        Error::NoMemory => ENOMEM,
        Error::IoFailed => EIO,
        Error::BadInode | Error::BadDentry | Error::BadSuperblock => EIO,
        Error::BadFormat | Error::BadAbi | Error::BadInterpreter => ENOEXEC,
        Error::NoEnt => ENOENT,
        Error::Exists => EEXIST,
        Error::Busy => EBUSY,
        Error::NoAccess => EACCES,
        Error::BadOperation => EOPNOTSUPP,
        Error::DevMinorLimit | Error::DevMajorLimit => ENODEV,
        Error::MaxSize => EMFILE,
        Error::SegFault => EFAULT,
        Error::InvalidArgs => EINVAL,
    }
}

/// Folds a kernel result into the negative-errno return convention.
#[must_use]
pub fn errno_result(result: boson_core::Result<isize>) -> isize {
    match result {
        Ok(v) => v,
        Err(e) => -(errno_of(e) as isize),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn representative_mappings() {
        assert_eq!(errno_of(Error::NoMemory), ENOMEM);
        assert_eq!(errno_of(Error::NoEnt), ENOENT);
        assert_eq!(errno_of(Error::SegFault), EFAULT);
        assert_eq!(errno_of(Error::BadAbi), ENOEXEC);
        assert_eq!(errno_of(Error::MaxSize), EMFILE);
    }

    #[test]
    fn results_fold_to_negative_errno() {
        assert_eq!(errno_result(Ok(42)), 42);
        assert_eq!(errno_result(Err(Error::InvalidArgs)), -22);
    }
}
