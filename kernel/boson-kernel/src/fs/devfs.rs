//! devfs — the device filesystem.
//!
//! A virtual filesystem exposing registered devices as nodes under
//! `/dev`: character devices carry their own file ops, block devices
//! read through the owning drive's cache. Device numbers are bounded;
//! exhaustion surfaces as `DevMajorLimit` / `DevMinorLimit`.

use alloc::format;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use boson_block::{Drive, Partition};
use boson_core::sync::SpinLock;
use boson_core::{Error, Result, kdebug};
use boson_fs::dentry::{Dentry, DentryOps};
use boson_fs::file::{File, FileOps, OpenFlags};
use boson_fs::inode::{Inode, InodeType};
use boson_fs::superblock::Superblock;
use boson_fs::vfs::{FileSystem, FsKind};

use crate::drivers::input;

/// Highest assignable major number.
const MAX_MAJOR: u32 = 255;

/// Minors per major.
const MAX_MINOR: u32 = 256;

/// What a devfs node stands for.
enum NodeKind {
    /// Character device with caller-supplied file ops.
    Char {
        ops: &'static dyn FileOps,
    },
    /// Block device partition, read through the drive cache.
    Block {
        drive: Arc<Drive>,
        partition: Arc<Partition>,
    },
}

struct DevNode {
    name: String,
    major: u32,
    minor: u32,
    kind: NodeKind,
}

static NODES: SpinLock<Vec<Arc<DevNode>>> = SpinLock::new(Vec::new());

/// Next dynamically assigned major.
static NEXT_DYN_MAJOR: AtomicU32 = AtomicU32::new(240);

/// Block-device major.
const BLOCK_MAJOR: u32 = 8;

/// Inode index allocator for devfs nodes.
static NEXT_INODE: AtomicU32 = AtomicU32::new(1);

/// Allocates a dynamic major number.
///
/// # Errors
///
/// `DevMajorLimit` when the dynamic range is exhausted.
pub fn alloc_major() -> Result<u32> {
    let major = NEXT_DYN_MAJOR.fetch_add(1, Ordering::Relaxed);
    if major > MAX_MAJOR {
        return Err(Error::DevMajorLimit);
    }
    Ok(major)
}

fn next_minor_for(major: u32) -> Result<u32> {
    let nodes = NODES.lock();
    let used = nodes.iter().filter(|n| n.major == major).count() as u32;
    if used >= MAX_MINOR {
        return Err(Error::DevMinorLimit);
    }
    Ok(used)
}

/// Registers a character device node.
///
/// # Errors
///
/// `Exists` for a duplicate name, `DevMinorLimit` when the major's minor
/// space is full.
pub fn register_char(name: String, major: u32, ops: &'static dyn FileOps) -> Result<u32> {
    let minor = next_minor_for(major)?;
    let mut nodes = NODES.lock();
    if nodes.iter().any(|n| n.name == name) {
        return Err(Error::Exists);
    }
    kdebug!("devfs: char {}:{} '{}'", major, minor, name);
    nodes.push(Arc::new(DevNode {
        name,
        major,
        minor,
        kind: NodeKind::Char { ops },
    }));
    Ok(minor)
}

/// Registers a block device node for one partition.
///
/// # Errors
///
/// `Exists` / `DevMinorLimit` as for [`register_char`].
pub fn register_block(name: String, drive: Arc<Drive>, partition: Arc<Partition>) -> Result<u32> {
    let minor = next_minor_for(BLOCK_MAJOR)?;
    let mut nodes = NODES.lock();
    if nodes.iter().any(|n| n.name == name) {
        return Err(Error::Exists);
    }
    kdebug!("devfs: block {}:{} '{}'", BLOCK_MAJOR, minor, name);
    nodes.push(Arc::new(DevNode {
        name,
        major: BLOCK_MAJOR,
        minor,
        kind: NodeKind::Block { drive, partition },
    }));
    Ok(minor)
}

/// Registers block nodes for a drive's partitions (after a GPT probe).
///
/// The base partition gets the drive's own name; numbered partitions use
/// their probe-assigned names.
///
/// # Errors
///
/// See [`register_block`].
pub fn register_drive(drive: &Arc<Drive>) -> Result<()> {
    for partition in drive.partitions() {
        let name = partition.name.clone();
        match register_block(name, drive.clone(), partition) {
            Ok(_) | Err(Error::Exists) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Registers `/dev/eventN` nodes for every input device.
///
/// # Errors
///
/// See [`register_char`].
pub fn register_input_nodes() -> Result<()> {
    let mut minor = 0;
    while let Some(device) = input::device_by_minor(minor) {
        let name = format!("event{}", device.minor);
        match register_char(name, input::INPUT_MAJOR, &INPUT_FILE_OPS) {
            Ok(_) | Err(Error::Exists) => {}
            Err(e) => return Err(e),
        }
        minor += 1;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// File ops
// ---------------------------------------------------------------------------

/// Block node reads go through the drive's logical block cache.
struct BlockFileOps;

impl FileOps for BlockFileOps {
    fn read(&self, file: &File, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let inode = file.dentry.inode().ok_or(Error::BadInode)?;
        let node = node_of(&inode).ok_or(Error::BadInode)?;
        let NodeKind::Block { drive, partition } = &node.kind else {
            return Err(Error::BadOperation);
        };
        let part_bytes = partition.lba_count << drive.lba_shift();
        if offset >= part_bytes {
            return Ok(0);
        }
        let take = (buf.len() as u64).min(part_bytes - offset) as usize;
        let base = partition.byte_offset(drive.lba_shift());
        let data = drive.read_bytes(base + offset, take)?;
        buf[..take].copy_from_slice(&data);
        Ok(take)
    }
}

static BLOCK_FILE_OPS: BlockFileOps = BlockFileOps;

/// `/dev/eventN` reads drain the node's shared listener as raw events.
struct InputFileOps;

/// Wire size of one input event record.
const EVENT_RECORD: usize = 16;

impl FileOps for InputFileOps {
    fn read(&self, file: &File, _offset: u64, buf: &mut [u8]) -> Result<usize> {
        let inode = file.dentry.inode().ok_or(Error::BadInode)?;
        let device = input::device_by_minor(inode_minor(&inode)).ok_or(Error::NoEnt)?;
        let listener = listener_of(&inode, &device);
        let mut done = 0;
        while done + EVENT_RECORD <= buf.len() {
            let Some(event) = listener.pop_event() else {
                break;
            };
            buf[done..done + 2].copy_from_slice(&event.event_type.to_le_bytes());
            buf[done + 2..done + 4].copy_from_slice(&event.action.to_le_bytes());
            buf[done + 4..done + 6].copy_from_slice(&event.code.to_le_bytes());
            buf[done + 6..done + 8].copy_from_slice(&[0, 0]);
            buf[done + 8..done + 16].copy_from_slice(&event.timestamp.to_le_bytes());
            done += EVENT_RECORD;
        }
        Ok(done)
    }
}

static INPUT_FILE_OPS: InputFileOps = InputFileOps;

/// Per-inode payload: the backing node, plus the shared listener for
/// input nodes.
struct DevInodeData {
    node: Arc<DevNode>,
    listener: SpinLock<Option<Arc<input::InputListener>>>,
}

fn node_of(inode: &Inode) -> Option<Arc<DevNode>> {
    inode.with_fs_data::<DevInodeData, _>(|d| d.node.clone())
}

fn inode_minor(inode: &Inode) -> u32 {
    inode
        .with_fs_data::<DevInodeData, _>(|d| d.node.minor)
        .unwrap_or(0)
}

fn listener_of(inode: &Inode, device: &Arc<input::InputDevice>) -> Arc<input::InputListener> {
    inode
        .with_fs_data::<DevInodeData, _>(|d| {
            let mut slot = d.listener.lock();
            match slot.as_ref() {
                Some(listener) => listener.clone(),
                None => {
                    let listener = device.add_listener();
                    *slot = Some(listener.clone());
                    listener
                }
            }
        })
        .expect("devfs inode payload")
}

// ---------------------------------------------------------------------------
// Dentry ops
// ---------------------------------------------------------------------------

struct DevfsDentryOps;

impl DentryOps for DevfsDentryOps {
    fn lookup(&self, parent: &Arc<Dentry>, name: &str) -> Result<Arc<Dentry>> {
        let node = NODES
            .lock()
            .iter()
            .find(|n| n.name == name)
            .cloned()
            .ok_or(Error::NoEnt)?;
        let typ = match node.kind {
            NodeKind::Char { .. } => InodeType::CharDevice,
            NodeKind::Block { .. } => InodeType::BlockDevice,
        };
        let inode = Inode::new(NEXT_INODE.fetch_add(1, Ordering::Relaxed), typ, 0o600);
        inode.set_fs_data(alloc::boxed::Box::new(DevInodeData {
            node,
            listener: SpinLock::new(None),
        }));
        let sb = parent
            .superblock()
            .map_or_else(Weak::new, |sb| Arc::downgrade(&sb));
        Ok(Dentry::new(name, sb, &DEVFS_DENTRY_OPS, Some(inode)))
    }

    fn open(&self, dentry: &Arc<Dentry>) -> Result<Arc<File>> {
        let inode = dentry.inode().ok_or(Error::BadInode)?;
        let node = node_of(&inode).ok_or(Error::BadInode)?;
        let ops: &'static dyn FileOps = match &node.kind {
            NodeKind::Char { ops } => *ops,
            NodeKind::Block { .. } => &BLOCK_FILE_OPS,
        };
        Ok(File::new(dentry.clone(), ops, OpenFlags::READ | OpenFlags::WRITE))
    }
}

static DEVFS_DENTRY_OPS: DevfsDentryOps = DevfsDentryOps;

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

fn devfs_mount(
    _drive: Option<Arc<Drive>>,
    _partition: Option<Arc<Partition>>,
) -> Result<Arc<Superblock>> {
    let sb = Superblock::new(None, None, boson_mm::PAGE_SIZE as u32);
    let root_inode = Inode::new(
        NEXT_INODE.fetch_add(1, Ordering::Relaxed),
        InodeType::Directory,
        0o755,
    );
    let root = Dentry::new("", Arc::downgrade(&sb), &DEVFS_DENTRY_OPS, Some(root_inode));
    sb.set_root(root);
    Ok(sb)
}

fn devfs_unmount(_sb: &Arc<Superblock>) -> Result<()> {
    Ok(())
}

/// The registrable devfs driver.
pub static DEVFS: FileSystem = FileSystem {
    name: "devfs",
    kind: FsKind::Virtual,
    mount: devfs_mount,
    unmount: devfs_unmount,
};

#[cfg(test)]
mod tests {
    use super::*;
    use boson_block::drive::{DriveFlags, DriveIo, IoOperation, IoRequest, IoStatus};
    use std::sync::Mutex;

    struct PatternDisk {
        store: Mutex<Vec<u8>>,
    }

    impl DriveIo for PatternDisk {
        fn handle_io(&self, drive: &Drive, request: &IoRequest) -> bool {
            assert_eq!(request.operation, IoOperation::Read);
            let offset = request.lba as usize * 512;
            let len = request.lba_count as usize * 512;
            {
                let store = self.store.lock().unwrap();
                // SAFETY: The submitter's buffer covers `len` bytes.
                unsafe {
                    core::ptr::copy_nonoverlapping(store[offset..].as_ptr(), request.buffer, len);
                }
            }
            drive.complete_io(request.id, IoStatus::Success);
            true
        }
    }

    struct EchoOps;
    impl FileOps for EchoOps {
        fn read(&self, _f: &File, _o: u64, buf: &mut [u8]) -> Result<usize> {
            let n = buf.len().min(4);
            buf[..n].copy_from_slice(&b"echo"[..n]);
            Ok(n)
        }
    }
    static ECHO_OPS: EchoOps = EchoOps;

    fn devfs_root() -> Arc<Dentry> {
        crate::test_support::install_frames();
        devfs_mount(None, None).unwrap().root()
    }

    #[test]
    fn char_node_lookup_and_read() {
        let root = devfs_root();
        let major = alloc_major().unwrap();
        register_char(String::from("echo0"), major, &ECHO_OPS).unwrap();

        let dentry = root.ops().lookup(&root, "echo0").unwrap();
        assert_eq!(dentry.inode().unwrap().typ, InodeType::CharDevice);
        let file = dentry.open().unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(file.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"echo");
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let _root = devfs_root();
        let major = alloc_major().unwrap();
        register_char(String::from("dup0"), major, &ECHO_OPS).unwrap();
        assert_eq!(
            register_char(String::from("dup0"), major, &ECHO_OPS).unwrap_err(),
            Error::Exists
        );
    }

    #[test]
    fn block_node_reads_partition_bytes() {
        let root = devfs_root();
        let mut image = vec![0u8; 1 << 20];
        image[2048..2052].copy_from_slice(b"part");
        let drive = Drive::new(
            String::from("vdd"),
            512,
            1 << 20,
            DriveFlags::PARTITIONABLE,
            Arc::new(PatternDisk {
                store: Mutex::new(image),
            }),
        );
        // A partition starting at LBA 4 (byte 2048).
        let partition = Arc::new(Partition {
            index: 1,
            first_lba: 4,
            lba_count: 16,
            name: String::from("vdd1"),
        });
        drive.add_partition(partition.clone());
        register_block(String::from("vdd1"), drive, partition).unwrap();

        let dentry = root.ops().lookup(&root, "vdd1").unwrap();
        assert_eq!(dentry.inode().unwrap().typ, InodeType::BlockDevice);
        let file = dentry.open().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(file.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"part");

        // Reads clamp at the partition end.
        let mut big = [0u8; 512];
        assert_eq!(file.read_at(16 * 512 - 4, &mut big).unwrap(), 4);
        assert_eq!(file.read_at(16 * 512, &mut big).unwrap(), 0);
    }

    #[test]
    fn register_drive_creates_all_partition_nodes() {
        let root = devfs_root();
        let drive = Drive::new(
            String::from("vde"),
            512,
            1 << 20,
            DriveFlags::PARTITIONABLE,
            Arc::new(PatternDisk {
                store: Mutex::new(vec![0u8; 1 << 20]),
            }),
        );
        drive.add_partition(Arc::new(Partition {
            index: 1,
            first_lba: 8,
            lba_count: 8,
            name: String::from("vde1"),
        }));
        register_drive(&drive).unwrap();
        // Base partition node plus the numbered one.
        assert!(root.ops().lookup(&root, "vde").is_ok());
        assert!(root.ops().lookup(&root, "vde1").is_ok());
    }

    #[test]
    fn input_nodes_surface_events() {
        let root = devfs_root();
        let device = input::register_device(String::from("kbd-devfs")).unwrap();
        register_input_nodes().unwrap();

        let name = format!("event{}", device.minor);
        let dentry = root.ops().lookup(&root, name.as_str()).unwrap();
        let file = dentry.open().unwrap();

        // The first read lazily attaches the listener; events then flow.
        let mut buf = [0u8; EVENT_RECORD];
        assert_eq!(file.read(&mut buf).unwrap(), 0);
        device.push_key_event(input::InputEvent {
            event_type: 1,
            action: 1,
            code: 57,
            timestamp: 5,
        });
        assert_eq!(file.read(&mut buf).unwrap(), EVENT_RECORD);
        assert_eq!(u16::from_le_bytes([buf[4], buf[5]]), 57);
    }
}
