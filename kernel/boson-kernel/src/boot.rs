//! Kernel initialization.
//!
//! The boot loader (BOOTBOOT-style handoff) drops us in 64-bit mode with
//! the higher-half direct map in place; everything after that is
//! sequenced here: logging, CPU structures, physical memory, the VFS
//! tree, the initrd, and finally the first user process before this CPU
//! becomes its own idle loop.

use boson_core::{kinfo, kwarn};
use boson_fs::vfs;

use crate::fs::{devfs, ext2, initrd, tmpfs};
use crate::mm::pmm::MemoryRegion;
use crate::proc::{self, Credentials, Process};

/// What the boot loader hands over.
pub trait BootInfo {
    /// Usable RAM regions.
    fn memory_map(&self) -> &[MemoryRegion];

    /// Offset of the higher-half direct map.
    fn hhdm_offset(&self) -> u64;

    /// The initial ramdisk archive, if one was loaded.
    fn initrd(&self) -> Option<&'static [u8]>;

    /// Total physical memory in bytes.
    fn total_memory(&self) -> u64 {
        self.memory_map().iter().map(|r| r.len).sum()
    }
}

/// Candidate init paths, tried in order.
const INIT_PATHS: [&str; 3] = ["/init", "/bin/init", "/sbin/init"];

/// Brings the kernel up and never returns.
///
/// # Panics
///
/// Panics when an essential subsystem (memory, root filesystem) cannot
/// initialize — there is nothing to fall back to.
pub fn kernel_init(boot: &impl BootInfo) -> ! {
    crate::log::init_early_serial();
    kinfo!("boson starting, {} MiB RAM", boot.total_memory() >> 20);

    crate::arch::cpu_init();
    crate::mm::hhdm::init(boot.hhdm_offset());
    crate::mm::pmm::init(boot.memory_map()).expect("no usable memory");
    crate::arch::x86_64::paging::init_kernel_root();

    // Heap works from here on.
    crate::log::init_logger(boson_core::log::LogLevel::Info);
    boson_fs::lookup_cache::init(boot.total_memory()).expect("dentry cache");
    crate::time::init();

    // Filesystems: tmpfs root, /dev, and the on-disk driver.
    vfs::register(&tmpfs::TMPFS).expect("register tmpfs");
    vfs::register(&devfs::DEVFS).expect("register devfs");
    vfs::register(&ext2::EXT2).expect("register ext2");

    let root_sb = (tmpfs::TMPFS.mount)(None, None).expect("mount root tmpfs");
    let root = root_sb.root();
    vfs::set_root(root.clone());

    let dev_dir = root
        .ops()
        .make_directory(&root, "dev")
        .expect("create /dev");
    vfs::mount_at(&dev_dir, &devfs::DEVFS, None, None).expect("mount devfs");

    if let Some(archive) = boot.initrd() {
        match initrd::unpack(archive, &root) {
            Ok(files) => kinfo!("root populated from initrd ({files} files)"),
            Err(e) => kwarn!("initrd unpack failed: {e}"),
        }
    } else {
        kwarn!("no initrd; root stays empty");
    }

    spawn_init(&root);

    kinfo!("boot complete; entering idle");
    boson_sched::scheduler().idle_loop()
}

/// Loads and enqueues the init process, if an init binary exists.
fn spawn_init(root: &alloc::sync::Arc<boson_fs::Dentry>) {
    let Some((path, dentry)) = INIT_PATHS
        .iter()
        .find_map(|p| vfs::resolve(p, Some(root.clone())).ok().map(|d| (*p, d)))
    else {
        kwarn!("no init binary found");
        return;
    };

    let run = || -> boson_core::Result<()> {
        let process = Process::new(None, Credentials { uid: 0, gid: 0 })?;
        *process.root.lock() = Some(root.clone());
        *process.cwd.lock() = Some(root.clone());
        *process.exe.lock() = Some(dentry.clone());

        let exe = dentry.open()?;
        let image = proc::exec::load(&process, exe, &[path], &["HOME=/", "TERM=linux"])?;
        proc::register_process(&process);
        proc::spawn_first_task(&process, &image)?;
        kinfo!("init '{}' pid {}", path, process.pid);
        Ok(())
    };
    if let Err(e) = run() {
        kwarn!("failed to start init '{}': {}", path, e);
    }
}
