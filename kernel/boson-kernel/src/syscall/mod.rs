//! Linux-compatible system call surface.
//!
//! Dispatch is a flat 256-slot table indexed by the syscall number from
//! the `syscall` instruction. Unimplemented numbers log a trace and
//! return `-ENOSYS`. Handlers return `isize` with the negative-errno
//! convention; [`linux::errno_result`] does the folding.

pub mod linux;

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use boson_core::{Error, Result, ktrace};

use crate::config;
use crate::proc::Process;

/// Handler signature: six raw registers in, one out.
pub type SyscallFn = fn(usize, usize, usize, usize, usize, usize) -> isize;

/// Table size; Linux x86-64 numbers above 255 are all `-ENOSYS` here.
const TABLE_SLOTS: usize = 256;

// Implemented syscall numbers (Linux x86-64 ABI).
const SYS_BRK: usize = 12;
const SYS_UNAME: usize = 63;
const SYS_ARCH_PRCTL: usize = 158;

/// The dispatch table.
static TABLE: [Option<SyscallFn>; TABLE_SLOTS] = {
    let mut table: [Option<SyscallFn>; TABLE_SLOTS] = [None; TABLE_SLOTS];
    table[SYS_BRK] = Some(sys_brk);
    table[SYS_UNAME] = Some(sys_uname);
    table[SYS_ARCH_PRCTL] = Some(sys_arch_prctl);
    table
};

/// Dispatches a system call by number.
///
/// Called from the `syscall` entry stub with the user's argument
/// registers.
#[must_use]
pub fn dispatch(nr: usize, a0: usize, a1: usize, a2: usize, a3: usize, a4: usize, a5: usize) -> isize {
    match TABLE.get(nr).copied().flatten() {
        Some(handler) => handler(a0, a1, a2, a3, a4, a5),
        None => {
            ktrace!("unimplemented syscall {nr}");
            -(linux::ENOSYS as isize)
        }
    }
}

/// The process owning the current task.
fn current_process() -> Result<Arc<Process>> {
    let task = boson_sched::current_task().ok_or(Error::InvalidArgs)?;
    let payload = task.user_payload().ok_or(Error::InvalidArgs)?.clone();
    payload
        .downcast::<Process>()
        .map_err(|_| Error::InvalidArgs)
}

// ---------------------------------------------------------------------------
// brk
// ---------------------------------------------------------------------------

/// `brk(new_brk)` — returns the (possibly unchanged) break.
fn sys_brk(new_brk: usize, _a1: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize) -> isize {
    linux::errno_result(current_process().map(|p| p.brk(new_brk as u64) as isize))
}

// ---------------------------------------------------------------------------
// arch_prctl
// ---------------------------------------------------------------------------

const ARCH_SET_GS: usize = 0x1001;
const ARCH_SET_FS: usize = 0x1002;
const ARCH_GET_FS: usize = 0x1003;
const ARCH_GET_GS: usize = 0x1004;

/// `arch_prctl(op, addr)` — FS/GS base control; other ops are `-EINVAL`.
fn sys_arch_prctl(op: usize, addr: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize) -> isize {
    let inner = || -> Result<isize> {
        let process = current_process()?;
        match op {
            ARCH_SET_FS => {
                process.fs_base.store(addr as u64, Ordering::Release);
                #[cfg(target_os = "none")]
                // SAFETY: Writing FS base for the current user thread.
                unsafe {
                    crate::arch::x86_64::instructions::write_fs_base(addr as u64);
                }
                Ok(0)
            }
            ARCH_SET_GS => {
                process.gs_base.store(addr as u64, Ordering::Release);
                Ok(0)
            }
            ARCH_GET_FS => {
                let value = process.fs_base.load(Ordering::Acquire);
                process
                    .space()
                    .copy_to_user(addr as u64, &value.to_le_bytes())?;
                Ok(0)
            }
            ARCH_GET_GS => {
                let value = process.gs_base.load(Ordering::Acquire);
                process
                    .space()
                    .copy_to_user(addr as u64, &value.to_le_bytes())?;
                Ok(0)
            }
            _ => Err(Error::InvalidArgs),
        }
    };
    linux::errno_result(inner())
}

// ---------------------------------------------------------------------------
// uname
// ---------------------------------------------------------------------------

/// Field width of each `utsname` member.
const UTS_FIELD: usize = 65;

/// Builds the `utsname` payload: zeroed, then filled field by field.
fn build_utsname() -> [u8; UTS_FIELD * 6] {
    let mut buf = [0u8; UTS_FIELD * 6];
    let mut put = |idx: usize, s: &str| {
        let start = idx * UTS_FIELD;
        let len = s.len().min(UTS_FIELD - 1);
        buf[start..start + len].copy_from_slice(&s.as_bytes()[..len]);
    };
    put(0, config::UNAME_SYSNAME);
    put(1, "boson"); // nodename
    put(2, config::UNAME_RELEASE);
    put(3, config::UNAME_VERSION);
    put(4, config::UNAME_MACHINE);
    buf
}

/// `uname(buf)` — fills the caller's `struct utsname`.
fn sys_uname(buf: usize, _a1: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize) -> isize {
    let inner = || -> Result<isize> {
        let process = current_process()?;
        let payload = build_utsname();
        process.space().copy_to_user(buf as u64, &payload)?;
        Ok(0)
    };
    linux::errno_result(inner())
}
