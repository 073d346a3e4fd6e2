//! ext2 driver.
//!
//! Read path over a drive partition: superblock at byte 1024 of the
//! partition (magic 0xEF53), 128-byte on-disk inodes, root at inode 2,
//! direct plus single/double indirect block pointers. File and directory
//! contents go through the generic cached-read helpers; the per-inode
//! cache's default write-back hook makes the mount effectively
//! read-only, which is all the initramfs-and-root use case needs.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec;

use boson_block::{Drive, Partition};
use boson_core::{Error, Result, kinfo};
use boson_fs::cached::{self, CacheBackend};
use boson_fs::dentry::{Dentry, DentryOps};
use boson_fs::file::{File, FileOps, OpenFlags};
use boson_fs::inode::{Inode, InodeType};
use boson_fs::superblock::Superblock;
use boson_fs::vfs::{FileSystem, FsKind};
use boson_mm::cache::CacheBlock;

/// Superblock magic.
const EXT2_MAGIC: u16 = 0xEF53;

/// Byte offset of the superblock within the partition.
const SUPERBLOCK_OFFSET: u64 = 1024;

/// Root directory inode index.
const ROOT_INODE: u32 = 2;

/// On-disk inode record size (revision 0).
const INODE_SIZE: usize = 128;

/// Direct block pointers per inode.
const DIRECT_BLOCKS: usize = 12;

/// Group descriptor record size.
const GROUP_DESC_SIZE: usize = 32;

fn le_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(*data[off..].first_chunk().expect("caller checked bounds"))
}

fn le_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(*data[off..].first_chunk().expect("caller checked bounds"))
}

/// Parsed superblock fields the driver needs.
#[derive(Debug, Clone, Copy)]
struct Ext2Sb {
    inodes_count: u32,
    first_data_block: u32,
    block_size: u32,
    inodes_per_group: u32,
}

impl Ext2Sb {
    /// Parses and validates the 1024-byte superblock record.
    fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 1024 {
            return Err(Error::BadSuperblock);
        }
        if le_u16(raw, 56) != EXT2_MAGIC {
            return Err(Error::BadSuperblock);
        }
        let log_block_size = le_u32(raw, 24);
        if log_block_size > 6 {
            return Err(Error::BadSuperblock);
        }
        let inodes_per_group = le_u32(raw, 40);
        if inodes_per_group == 0 {
            return Err(Error::BadSuperblock);
        }
        Ok(Self {
            inodes_count: le_u32(raw, 0),
            first_data_block: le_u32(raw, 20),
            block_size: 1 << (log_block_size + 10),
            inodes_per_group,
        })
    }
}

/// One mounted ext2 instance.
struct Ext2Fs {
    drive: Arc<Drive>,
    part_offset: u64,
    sb: Ext2Sb,
}

/// On-disk inode fields carried in the VFS inode's payload.
#[derive(Debug, Clone, Copy)]
struct Ext2InodeData {
    blocks: [u32; 15],
}

impl Ext2Fs {
    /// Reads one filesystem block.
    fn read_block(&self, block: u32) -> Result<alloc::vec::Vec<u8>> {
        self.drive.read_bytes(
            self.part_offset + block as u64 * self.sb.block_size as u64,
            self.sb.block_size as usize,
        )
    }

    /// Inode-table block of the group holding `inode_idx`.
    fn inode_location(&self, inode_idx: u32) -> Result<(u32, usize)> {
        if inode_idx == 0 || inode_idx > self.sb.inodes_count {
            return Err(Error::BadInode);
        }
        let group = (inode_idx - 1) / self.sb.inodes_per_group;
        let index_in_group = ((inode_idx - 1) % self.sb.inodes_per_group) as usize;

        // Group descriptors start in the block after the superblock.
        let desc_block = self.sb.first_data_block + 1;
        let descs = self.read_block(desc_block)?;
        let desc_off = group as usize * GROUP_DESC_SIZE;
        if desc_off + GROUP_DESC_SIZE > descs.len() {
            return Err(Error::BadInode);
        }
        let inode_table = le_u32(&descs, desc_off + 8);

        let per_block = self.sb.block_size as usize / INODE_SIZE;
        let block = inode_table + (index_in_group / per_block) as u32;
        let offset = (index_in_group % per_block) * INODE_SIZE;
        Ok((block, offset))
    }

    /// Reads a 128-byte on-disk inode and lifts it into a VFS inode.
    fn read_inode(&self, inode_idx: u32) -> Result<Arc<Inode>> {
        let (block, offset) = self.inode_location(inode_idx)?;
        let raw = self.read_block(block)?;
        let rec = &raw[offset..offset + INODE_SIZE];

        let mode = le_u16(rec, 0);
        let typ = match mode & 0xF000 {
            0x1000 => InodeType::Fifo,
            0x2000 => InodeType::CharDevice,
            0x4000 => InodeType::Directory,
            0x6000 => InodeType::BlockDevice,
            0x8000 => InodeType::RegularFile,
            0xA000 => InodeType::SymbolicLink,
            0xC000 => InodeType::Socket,
            _ => InodeType::Unknown,
        };

        let inode = Inode::new(inode_idx, typ, mode & 0x0FFF);
        inode.set_size(u64::from(le_u32(rec, 4)));
        inode
            .atime
            .store(u64::from(le_u32(rec, 8)), core::sync::atomic::Ordering::Relaxed);
        inode
            .ctime
            .store(u64::from(le_u32(rec, 12)), core::sync::atomic::Ordering::Relaxed);
        inode
            .mtime
            .store(u64::from(le_u32(rec, 16)), core::sync::atomic::Ordering::Relaxed);
        inode
            .links
            .store(u32::from(le_u16(rec, 26)), core::sync::atomic::Ordering::Relaxed);

        let mut blocks = [0u32; 15];
        for (i, slot) in blocks.iter_mut().enumerate() {
            *slot = le_u32(rec, 40 + i * 4);
        }
        inode.set_fs_data(Box::new(Ext2InodeData { blocks }));
        Ok(inode)
    }

    /// Resolves a file-relative block number to a disk block (0 = hole).
    fn disk_block_of(&self, data: &Ext2InodeData, file_block: u32) -> Result<u32> {
        let ptrs_per_block = self.sb.block_size / 4;
        let mut remaining = file_block;

        if remaining < DIRECT_BLOCKS as u32 {
            return Ok(data.blocks[remaining as usize]);
        }
        remaining -= DIRECT_BLOCKS as u32;

        if remaining < ptrs_per_block {
            let table_block = data.blocks[12];
            if table_block == 0 {
                return Ok(0);
            }
            let table = self.read_block(table_block)?;
            return Ok(le_u32(&table, remaining as usize * 4));
        }
        remaining -= ptrs_per_block;

        if remaining < ptrs_per_block * ptrs_per_block {
            let outer_block = data.blocks[13];
            if outer_block == 0 {
                return Ok(0);
            }
            let outer = self.read_block(outer_block)?;
            let inner_block = le_u32(&outer, (remaining / ptrs_per_block) as usize * 4);
            if inner_block == 0 {
                return Ok(0);
            }
            let inner = self.read_block(inner_block)?;
            return Ok(le_u32(&inner, (remaining % ptrs_per_block) as usize * 4));
        }

        // Triple indirection is beyond this driver.
        Err(Error::BadOperation)
    }
}

/// Fetches the mounted instance from a dentry's superblock payload.
fn fs_of(dentry: &Dentry) -> Result<Arc<Ext2Fs>> {
    let sb = dentry.superblock().ok_or(Error::BadSuperblock)?;
    sb.with_fs_data::<Arc<Ext2Fs>, _>(Arc::clone)
        .ok_or(Error::BadSuperblock)
}

// ---------------------------------------------------------------------------
// Cache backend
// ---------------------------------------------------------------------------

/// Populates inode cache blocks from the partition's data blocks.
struct Ext2Backend {
    fs: Arc<Ext2Fs>,
}

impl CacheBackend for Ext2Backend {
    fn read_cache_block(&self, inode: &Inode, block: &CacheBlock) -> Result<()> {
        let Some(data) = inode.with_fs_data::<Ext2InodeData, _>(|d| *d) else {
            return Err(Error::BadInode);
        };
        let fs_block_size = self.fs.sb.block_size as usize;
        let cache_bytes = block.size().bytes();
        let fs_blocks_per_cache = cache_bytes / fs_block_size;
        let first = block.index() as usize * fs_blocks_per_cache;

        block.zero();
        for i in 0..fs_blocks_per_cache {
            let file_block = (first + i) as u32;
            if file_block as u64 * fs_block_size as u64 >= inode.size() {
                break;
            }
            let disk_block = self.fs.disk_block_of(&data, file_block)?;
            if disk_block == 0 {
                continue; // hole, stays zero
            }
            let bytes = self.fs.read_block(disk_block)?;
            block.fill_at(i * fs_block_size, &bytes);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File ops
// ---------------------------------------------------------------------------

struct Ext2FileOps;

impl FileOps for Ext2FileOps {
    fn read(&self, file: &File, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let inode = file.dentry.inode().ok_or(Error::BadInode)?;
        let backend = Ext2Backend {
            fs: fs_of(&file.dentry)?,
        };
        cached::cached_read(&inode, &backend, offset, buf)
    }

    fn mmap_block(&self, file: &File, block_index: u32) -> Result<Arc<CacheBlock>> {
        let inode = file.dentry.inode().ok_or(Error::BadInode)?;
        let backend = Ext2Backend {
            fs: fs_of(&file.dentry)?,
        };
        cached::get_cache_block_or_read(&inode, block_index, &backend)
    }
}

static EXT2_FILE_OPS: Ext2FileOps = Ext2FileOps;

// ---------------------------------------------------------------------------
// Directories
// ---------------------------------------------------------------------------

/// Iterates `(inode, name)` pairs of a directory inode.
fn for_each_dir_entry(
    fs: &Arc<Ext2Fs>,
    dir: &Arc<Inode>,
    mut f: impl FnMut(u32, &str) -> bool,
) -> Result<()> {
    let backend = Ext2Backend { fs: fs.clone() };
    let size = dir.size() as usize;
    let mut raw = vec![0u8; size];
    let read = cached::cached_read(dir, &backend, 0, &mut raw)?;

    let mut pos = 0;
    while pos + 8 <= read {
        let entry_inode = le_u32(&raw, pos);
        let rec_len = le_u16(&raw, pos + 4) as usize;
        let name_len = raw[pos + 6] as usize;
        if rec_len < 8 || pos + rec_len > read {
            return Err(Error::BadFormat);
        }
        if entry_inode != 0 && name_len > 0 && pos + 8 + name_len <= read {
            if let Ok(name) = core::str::from_utf8(&raw[pos + 8..pos + 8 + name_len]) {
                if !f(entry_inode, name) {
                    return Ok(());
                }
            }
        }
        pos += rec_len;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Dentry ops
// ---------------------------------------------------------------------------

struct Ext2DentryOps;

impl DentryOps for Ext2DentryOps {
    fn lookup(&self, parent: &Arc<Dentry>, name: &str) -> Result<Arc<Dentry>> {
        let fs = fs_of(parent)?;
        let dir = parent.inode().ok_or(Error::BadInode)?;
        if !dir.is_dir() {
            return Err(Error::BadDentry);
        }
        let mut found = None;
        for_each_dir_entry(&fs, &dir, |inode_idx, entry_name| {
            if entry_name == name {
                found = Some(inode_idx);
                false
            } else {
                true
            }
        })?;
        let inode_idx = found.ok_or(Error::NoEnt)?;
        let inode = fs.read_inode(inode_idx)?;
        let sb = parent
            .superblock()
            .map_or_else(Weak::new, |sb| Arc::downgrade(&sb));
        Ok(Dentry::new(name, sb, &EXT2_DENTRY_OPS, Some(inode)))
    }

    fn open(&self, dentry: &Arc<Dentry>) -> Result<Arc<File>> {
        let inode = dentry.inode().ok_or(Error::BadInode)?;
        if inode.is_dir() {
            return Err(Error::BadOperation);
        }
        Ok(File::new(dentry.clone(), &EXT2_FILE_OPS, OpenFlags::READ))
    }
}

static EXT2_DENTRY_OPS: Ext2DentryOps = Ext2DentryOps;

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

fn ext2_mount(
    drive: Option<Arc<Drive>>,
    partition: Option<Arc<Partition>>,
) -> Result<Arc<Superblock>> {
    let drive = drive.ok_or(Error::InvalidArgs)?;
    let partition = partition.ok_or(Error::InvalidArgs)?;
    let part_offset = partition.byte_offset(drive.lba_shift());

    let raw = drive.read_bytes(part_offset + SUPERBLOCK_OFFSET, 1024)?;
    let parsed = Ext2Sb::parse(&raw)?;
    kinfo!(
        "ext2: {} inodes, {} byte blocks on {}",
        parsed.inodes_count,
        parsed.block_size,
        partition.name
    );

    let fs = Arc::new(Ext2Fs {
        drive: drive.clone(),
        part_offset,
        sb: parsed,
    });
    let sb = Superblock::new(Some(drive), Some(partition), parsed.block_size);
    sb.set_fs_data(Box::new(fs.clone()));

    let root_inode = fs.read_inode(ROOT_INODE)?;
    if !root_inode.is_dir() {
        return Err(Error::BadSuperblock);
    }
    let root = Dentry::new("", Arc::downgrade(&sb), &EXT2_DENTRY_OPS, Some(root_inode));
    sb.set_root(root);
    Ok(sb)
}

fn ext2_unmount(sb: &Arc<Superblock>) -> Result<()> {
    if let Some(drive) = &sb.drive {
        drive.cache.flush()?;
    }
    Ok(())
}

/// The registrable ext2 driver.
pub static EXT2: FileSystem = FileSystem {
    name: "ext2",
    kind: FsKind::Device,
    mount: ext2_mount,
    unmount: ext2_unmount,
};

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;
    use boson_block::drive::{DriveFlags, DriveIo, IoOperation, IoRequest, IoStatus};
    use std::sync::Mutex;

    struct RamDisk {
        store: Mutex<Vec<u8>>,
    }

    impl DriveIo for RamDisk {
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

    const BS: usize = 1024;

    fn put_u16(image: &mut [u8], off: usize, v: u16) {
        image[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u32(image: &mut [u8], off: usize, v: u32) {
        image[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Writes a 128-byte inode record at `idx` in the table at block 5.
    fn put_inode(image: &mut [u8], idx: u32, mode: u16, size: u32, blocks: &[u32]) {
        let base = 5 * BS + (idx as usize - 1) * INODE_SIZE;
        put_u16(image, base, mode);
        put_u32(image, base + 4, size);
        put_u16(image, base + 26, 1); // links
        for (i, &b) in blocks.iter().enumerate() {
            put_u32(image, base + 40 + i * 4, b);
        }
    }

    /// Appends a directory entry, returning the next free offset.
    fn put_dirent(image: &mut [u8], at: usize, inode: u32, name: &str, rec_len: u16) -> usize {
        put_u32(image, at, inode);
        put_u16(image, at + 4, rec_len);
        image[at + 6] = name.len() as u8;
        image[at + 7] = 0;
        image[at + 8..at + 8 + name.len()].copy_from_slice(name.as_bytes());
        at + rec_len as usize
    }

    /// A tiny 1 MiB image: 1024-byte blocks, inode table at block 5,
    /// root (inode 2) with one file `hello.txt` (inode 12) at block 11.
    fn ext2_image() -> Vec<u8> {
        let mut image = vec![0u8; 1 << 20];

        // Superblock at byte 1024.
        let sb = 1024;
        put_u32(&mut image, sb, 32); // inodes_count
        put_u32(&mut image, sb + 4, 1024); // blocks_count
        put_u32(&mut image, sb + 20, 1); // first_data_block
        put_u32(&mut image, sb + 24, 0); // log_block_size → 1024
        put_u32(&mut image, sb + 32, 1024); // blocks_per_group
        put_u32(&mut image, sb + 40, 32); // inodes_per_group
        put_u16(&mut image, sb + 56, 0xEF53); // magic

        // Group descriptor 0 at block 2: inode table at block 5.
        put_u32(&mut image, 2 * BS + 8, 5);

        // Root directory: inode 2, one data block at block 10.
        put_inode(&mut image, 2, 0x41ED, BS as u32, &[10]);
        let mut at = 10 * BS;
        at = put_dirent(&mut image, at, 2, ".", 12);
        at = put_dirent(&mut image, at, 2, "..", 12);
        let used = (at - 10 * BS) as u16;
        put_dirent(&mut image, at, 12, "hello.txt", BS as u16 - used);

        // hello.txt: inode 12, contents at block 11.
        let content = b"Hello from a tiny ext2 image!\n";
        put_inode(&mut image, 12, 0x81A4, content.len() as u32, &[11]);
        image[11 * BS..11 * BS + content.len()].copy_from_slice(content);

        image
    }

    fn mount_image(image: Vec<u8>) -> Arc<Superblock> {
        crate::test_support::install_frames();
        let drive = Drive::new(
            String::from("ram2"),
            512,
            image.len() as u64,
            DriveFlags::PARTITIONABLE,
            Arc::new(RamDisk {
                store: Mutex::new(image),
            }),
        );
        let partition = drive.partitions()[0].clone();
        ext2_mount(Some(drive), Some(partition)).unwrap()
    }

    #[test]
    fn mounts_and_reads_a_file() {
        let sb = mount_image(ext2_image());
        let root = sb.root();
        assert!(root.inode().unwrap().is_dir());

        let dentry = root.ops().lookup(&root, "hello.txt").unwrap();
        let inode = dentry.inode().unwrap();
        assert_eq!(inode.index, 12);
        assert_eq!(inode.typ, InodeType::RegularFile);
        assert_eq!(inode.size(), 30);

        let file = dentry.open().unwrap();
        let mut buf = [0u8; 64];
        let n = file.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"Hello from a tiny ext2 image!\n");
    }

    #[test]
    fn missing_names_are_noent() {
        let sb = mount_image(ext2_image());
        let root = sb.root();
        assert_eq!(
            root.ops().lookup(&root, "absent").unwrap_err(),
            Error::NoEnt
        );
    }

    #[test]
    fn bad_magic_fails_the_mount() {
        let mut image = ext2_image();
        put_u16(&mut image, 1024 + 56, 0x1234);
        crate::test_support::install_frames();
        let drive = Drive::new(
            String::from("ram3"),
            512,
            image.len() as u64,
            DriveFlags::PARTITIONABLE,
            Arc::new(RamDisk {
                store: Mutex::new(image),
            }),
        );
        let partition = drive.partitions()[0].clone();
        assert_eq!(
            ext2_mount(Some(drive), Some(partition)).unwrap_err(),
            Error::BadSuperblock
        );
    }

    #[test]
    fn directories_do_not_open_as_files() {
        let sb = mount_image(ext2_image());
        let root = sb.root();
        assert_eq!(root.open().unwrap_err(), Error::BadOperation);
    }

    #[test]
    fn single_indirect_blocks_resolve() {
        let mut image = ext2_image();
        // File with 13 blocks: 12 direct (20..31), indirect table at 40
        // pointing to block 41 for file block 12.
        let mut blocks = [0u32; 15];
        for (i, b) in (20..32).enumerate() {
            blocks[i] = b;
        }
        blocks[12] = 40;
        put_inode(&mut image, 13, 0x81A4, (13 * BS) as u32, &blocks);
        put_u32(&mut image, 40 * BS, 41);
        image[41 * BS..41 * BS + 4].copy_from_slice(b"tail");

        // Wire it into the root directory in place of hello.txt.
        let sb = mount_image(image);
        let root = sb.root();
        let fs = fs_of(&root).unwrap();
        let inode = fs.read_inode(13).unwrap();
        let data = inode
            .with_fs_data::<Ext2InodeData, _>(|d| *d)
            .unwrap();
        assert_eq!(fs.disk_block_of(&data, 0).unwrap(), 20);
        assert_eq!(fs.disk_block_of(&data, 11).unwrap(), 31);
        assert_eq!(fs.disk_block_of(&data, 12).unwrap(), 41);

        // Reading through the cache sees the indirect block's bytes.
        let mut tail = [0u8; 4];
        let backend = Ext2Backend { fs: fs.clone() };
        cached::cached_read(&inode, &backend, 12 * BS as u64, &mut tail).unwrap();
        assert_eq!(&tail, b"tail");
    }
}
