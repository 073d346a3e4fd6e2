//! Process management.
//!
//! A process owns an address space, an open-file table, working/root
//! directories, credentials, and its tasks. Mutations go through the
//! per-process locks (`files`, the address space's map lock); the global
//! process table maps PIDs to live processes.

pub mod exec;
pub mod random;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use boson_core::id::Fd;
use boson_core::sync::SpinLock;
use boson_core::{Error, Result, kdebug};
use boson_fs::dentry::Dentry;
use boson_fs::file::File;
use boson_sched::task::{AddressSpaceHook, Task};
use boson_sched::waitq::WaitQueue;

use crate::mm::addr_space::AddressSpace;

#[cfg(target_os = "none")]
use crate::arch::x86_64::paging::PageTableMapper as KernelMapper;
#[cfg(not(target_os = "none"))]
use crate::mm::addr_space::HostMapper as KernelMapper;

/// Maximum open files per process.
const MAX_FILES: usize = 256;

/// Next PID to hand out.
static NEXT_PID: AtomicU32 = AtomicU32::new(1);

/// Global PID → process table.
static PROCESS_TABLE: SpinLock<BTreeMap<u32, Arc<Process>>> = SpinLock::new(BTreeMap::new());

/// Registers a process.
pub fn register_process(process: &Arc<Process>) {
    PROCESS_TABLE.lock().insert(process.pid, process.clone());
}

/// Looks up a process by PID.
#[must_use]
pub fn lookup_process(pid: u32) -> Option<Arc<Process>> {
    PROCESS_TABLE.lock().get(&pid).cloned()
}

/// Drops a process from the table (after exit and reaping).
pub fn unregister_process(pid: u32) {
    PROCESS_TABLE.lock().remove(&pid);
}

/// User and group identity.
#[derive(Debug, Clone, Copy)]
pub struct Credentials {
    /// User id.
    pub uid: u32,
    /// Group id.
    pub gid: u32,
}

/// Open-file table: fd-indexed slots.
pub struct FileTable {
    slots: Vec<Option<Arc<File>>>,
}

impl FileTable {
    fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Installs a file at the lowest free descriptor.
    ///
    /// # Errors
    ///
    /// `MaxSize` when every slot is taken.
    pub fn open(&mut self, file: Arc<File>) -> Result<Fd> {
        if let Some(idx) = self.slots.iter().position(Option::is_none) {
            self.slots[idx] = Some(file);
            return Ok(Fd::new(idx as u32));
        }
        if self.slots.len() >= MAX_FILES {
            return Err(Error::MaxSize);
        }
        self.slots.push(Some(file));
        Ok(Fd::new(self.slots.len() as u32 - 1))
    }

    /// The file at `fd`.
    #[must_use]
    pub fn get(&self, fd: Fd) -> Option<Arc<File>> {
        self.slots.get(fd.as_usize())?.clone()
    }

    /// Closes `fd`, dropping the file reference.
    ///
    /// # Errors
    ///
    /// `InvalidArgs` for an empty slot.
    pub fn close(&mut self, fd: Fd) -> Result<()> {
        match self.slots.get_mut(fd.as_usize()) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(Error::InvalidArgs),
        }
    }

    /// Count of open descriptors.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// The process heap region managed by `brk`.
#[derive(Debug, Clone, Copy)]
pub struct HeapRegion {
    /// Heap base (page aligned, just past the loaded image).
    pub base: u64,
    /// Current break.
    pub end: u64,
}

/// A user process.
pub struct Process {
    /// Process id.
    pub pid: u32,
    /// Parent PID; `None` for init.
    pub parent_pid: Option<u32>,
    /// Address space; its internal lock orders walk vs. modify.
    space: Arc<ProcessSpace>,
    /// Open files (`files_lock`).
    pub files: SpinLock<FileTable>,
    /// Working directory.
    pub cwd: SpinLock<Option<Arc<Dentry>>>,
    /// Root directory for path resolution.
    pub root: SpinLock<Option<Arc<Dentry>>>,
    /// The executable.
    pub exe: SpinLock<Option<Arc<Dentry>>>,
    /// The dynamic interpreter, if any.
    pub interp: SpinLock<Option<Arc<Dentry>>>,
    /// Identity.
    pub creds: Credentials,
    /// Pending signal bitmask.
    pub pending_signals: AtomicU64,
    /// Tasks belonging to this process.
    pub tasks: SpinLock<Vec<Arc<Task>>>,
    /// `brk` region.
    pub heap: SpinLock<HeapRegion>,
    /// FS segment base (`arch_prctl(ARCH_SET_FS)`).
    pub fs_base: AtomicU64,
    /// GS segment base (`arch_prctl(ARCH_SET_GS)`).
    pub gs_base: AtomicU64,
    /// Exit status once terminated.
    pub exit_status: SpinLock<Option<i32>>,
    /// Woken when the process exits.
    pub exit_wait: WaitQueue,
}

/// The address space plus its scheduler activation hook.
pub struct ProcessSpace {
    /// Map units over the kernel mapper.
    pub space: AddressSpace<KernelMapper>,
}

impl AddressSpaceHook for ProcessSpace {
    fn activate(&self) {
        #[cfg(target_os = "none")]
        // SAFETY: The root table was built by this space's mapper and
        // stays alive as long as the process does.
        unsafe {
            crate::arch::x86_64::paging::load_root(self.space.root_phys());
        }
    }
}

impl Process {
    /// Creates an empty process with a fresh address space.
    ///
    /// # Errors
    ///
    /// `NoMemory` when the root page table cannot be allocated.
    pub fn new(parent_pid: Option<u32>, creds: Credentials) -> Result<Arc<Self>> {
        let mapper = KernelMapper::new();
        let process = Arc::new(Self {
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            parent_pid,
            space: Arc::new(ProcessSpace {
                space: AddressSpace::new(mapper),
            }),
            files: SpinLock::new(FileTable::new()),
            cwd: SpinLock::new(None),
            root: SpinLock::new(None),
            exe: SpinLock::new(None),
            interp: SpinLock::new(None),
            creds,
            pending_signals: AtomicU64::new(0),
            tasks: SpinLock::new(Vec::new()),
            heap: SpinLock::new(HeapRegion { base: 0, end: 0 }),
            fs_base: AtomicU64::new(0),
            gs_base: AtomicU64::new(0),
            exit_status: SpinLock::new(None),
            exit_wait: WaitQueue::new(),
        });
        kdebug!("process {} created", process.pid);
        Ok(process)
    }

    /// The address space.
    #[must_use]
    pub fn space(&self) -> &AddressSpace<KernelMapper> {
        &self.space.space
    }

    /// The space as a scheduler activation hook.
    #[must_use]
    pub fn space_hook(&self) -> Arc<ProcessSpace> {
        self.space.clone()
    }

    /// Adjusts the program break.
    ///
    /// `new_brk == 0` queries the current break. Growth extends the heap
    /// unit; shrinking below the base is clamped. Returns the new break,
    /// Linux style.
    pub fn brk(&self, new_brk: u64) -> u64 {
        let mut heap = self.heap.lock();
        if new_brk == 0 || heap.base == 0 {
            return heap.end;
        }
        let clamped = new_brk.max(heap.base);
        if clamped > heap.end {
            let cur_top = heap.end.next_multiple_of(boson_mm::PAGE_SIZE as u64);
            let new_top = clamped.next_multiple_of(boson_mm::PAGE_SIZE as u64);
            if new_top > cur_top {
                let grown = self.space.space.map_anonymous(
                    cur_top,
                    new_top - cur_top,
                    crate::mm::addr_space::MapFlags::READ
                        | crate::mm::addr_space::MapFlags::WRITE
                        | crate::mm::addr_space::MapFlags::USER,
                    false,
                );
                if grown.is_err() {
                    return heap.end;
                }
            }
        }
        heap.end = clamped;
        heap.end
    }

    /// Records a task as belonging to this process.
    pub fn attach_task(&self, task: Arc<Task>) {
        self.tasks.lock().push(task);
    }

    /// Marks the process exited and wakes waiters.
    pub fn exit(&self, status: i32) {
        *self.exit_status.lock() = Some(status);
        self.exit_wait.wake_all();
    }
}

/// Spawns the first task of a loaded process onto the least-loaded CPU.
///
/// The task enters through the ring-3 transition with the image's entry
/// point and initial stack.
///
/// # Errors
///
/// `NoMemory` when the kernel stack cannot be allocated.
#[cfg(target_os = "none")]
pub fn spawn_first_task(
    process: &Arc<Process>,
    image: &exec::LoadedImage,
) -> Result<Arc<Task>> {
    use alloc::boxed::Box;
    use core::any::Any;

    let ctx = Box::into_raw(Box::new((image.entry, image.stack_pointer))) as usize;
    let payload: Arc<dyn Any + Send + Sync> = process.clone();
    let task = Task::new_user(
        payload,
        process.space_hook(),
        crate::arch::x86_64::userspace::user_task_entry,
        ctx,
        0,
    )?;
    process.attach_task(task.clone());
    boson_sched::scheduler::enqueue_task_balanced(task.clone());
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials { uid: 1000, gid: 100 }
    }

    #[test]
    fn pids_are_unique() {
        crate::test_support::install_frames();
        let a = Process::new(None, creds()).unwrap();
        let b = Process::new(Some(a.pid), creds()).unwrap();
        assert_ne!(a.pid, b.pid);
        assert_eq!(b.parent_pid, Some(a.pid));
    }

    #[test]
    fn process_table_roundtrip() {
        crate::test_support::install_frames();
        let p = Process::new(None, creds()).unwrap();
        register_process(&p);
        assert!(lookup_process(p.pid).is_some());
        unregister_process(p.pid);
        assert!(lookup_process(p.pid).is_none());
    }

    #[test]
    fn file_table_allocates_lowest_free_slot() {
        use alloc::sync::Weak;
        use boson_fs::dentry::DentryOps;
        use boson_fs::file::{FileOps, OpenFlags};

        struct NullD;
        impl DentryOps for NullD {
            fn lookup(&self, _p: &Arc<Dentry>, _n: &str) -> Result<Arc<Dentry>> {
                Err(Error::NoEnt)
            }
            fn open(&self, _d: &Arc<Dentry>) -> Result<Arc<File>> {
                Err(Error::BadOperation)
            }
        }
        static ND: NullD = NullD;
        struct NullF;
        impl FileOps for NullF {
            fn read(&self, _f: &File, _o: u64, _b: &mut [u8]) -> Result<usize> {
                Ok(0)
            }
        }
        static NF: NullF = NullF;

        crate::test_support::install_frames();
        let mkfile = || {
            let d = Dentry::new("f", Weak::new(), &ND, None);
            File::new(d, &NF, OpenFlags::READ)
        };

        let mut table = FileTable::new();
        let fd0 = table.open(mkfile()).unwrap();
        let fd1 = table.open(mkfile()).unwrap();
        let fd2 = table.open(mkfile()).unwrap();
        assert_eq!((fd0.as_u32(), fd1.as_u32(), fd2.as_u32()), (0, 1, 2));

        table.close(fd1).unwrap();
        assert!(table.close(fd1).is_err(), "double close");
        let reused = table.open(mkfile()).unwrap();
        assert_eq!(reused.as_u32(), 1);
        assert_eq!(table.open_count(), 3);
    }

    #[test]
    fn brk_grows_and_queries() {
        crate::test_support::install_frames();
        let p = Process::new(None, creds()).unwrap();
        {
            let mut heap = p.heap.lock();
            heap.base = 0x4000_0000;
            heap.end = 0x4000_0000;
        }
        assert_eq!(p.brk(0), 0x4000_0000);
        let grown = p.brk(0x4000_5000);
        assert_eq!(grown, 0x4000_5000);
        // The backing unit exists and faults resolve.
        p.space().handle_fault(0x4000_1234, true).unwrap();
        // Shrinking below base clamps.
        assert_eq!(p.brk(0x3fff_0000), 0x4000_0000);
    }
}
