//! Initial ramdisk: a ustar archive unpacked into a filesystem.
//!
//! The boot handoff provides the archive bytes; every regular file and
//! directory is recreated under the target directory (normally the
//! tmpfs root) through the ordinary dentry ops.

use alloc::sync::Arc;

use boson_core::{Error, Result, kinfo};
use boson_fs::dentry::Dentry;
use boson_fs::path;

/// tar block granularity.
const TAR_BLOCK: usize = 512;

/// Offset of the name field.
const OFF_NAME: usize = 0;
/// Offset of the octal size field.
const OFF_SIZE: usize = 124;
/// Offset of the type flag.
const OFF_TYPE: usize = 156;
/// Offset of the `ustar` magic.
const OFF_MAGIC: usize = 257;

/// One parsed archive member.
struct TarEntry<'a> {
    name: &'a str,
    kind: u8,
    data: &'a [u8],
}

fn parse_octal(field: &[u8]) -> Result<usize> {
    let mut value = 0usize;
    for &byte in field {
        match byte {
            b'0'..=b'7' => value = value * 8 + (byte - b'0') as usize,
            0 | b' ' => break,
            _ => return Err(Error::BadFormat),
        }
    }
    Ok(value)
}

fn field_str(field: &[u8]) -> Result<&str> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    core::str::from_utf8(&field[..end]).map_err(|_| Error::BadFormat)
}

/// Iterates the members of a ustar archive.
struct TarIter<'a> {
    archive: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for TarIter<'a> {
    type Item = Result<TarEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let header = self.archive.get(self.pos..self.pos + TAR_BLOCK)?;
        // Two zero blocks (or running off the end) terminate the archive.
        if header.iter().all(|&b| b == 0) {
            return None;
        }
        if &header[OFF_MAGIC..OFF_MAGIC + 5] != b"ustar" {
            return Some(Err(Error::BadFormat));
        }
        let name = match field_str(&header[OFF_NAME..OFF_NAME + 100]) {
            Ok(name) => name,
            Err(e) => return Some(Err(e)),
        };
        let size = match parse_octal(&header[OFF_SIZE..OFF_SIZE + 12]) {
            Ok(size) => size,
            Err(e) => return Some(Err(e)),
        };
        let kind = header[OFF_TYPE];

        let data_start = self.pos + TAR_BLOCK;
        let data = match self.archive.get(data_start..data_start + size) {
            Some(data) => data,
            None => return Some(Err(Error::BadFormat)),
        };
        self.pos = data_start + size.next_multiple_of(TAR_BLOCK);
        Some(Ok(TarEntry { name, kind, data }))
    }
}

/// Walks (creating as needed) the directory path `dir` under `root`.
fn ensure_dirs(root: &Arc<Dentry>, dir: &str) -> Result<Arc<Dentry>> {
    let mut current = root.clone();
    for component in path::components(dir) {
        current = match current.find_child(component) {
            Some(child) => child,
            None => current.ops().make_directory(&current, component)?,
        };
    }
    Ok(current)
}

/// Unpacks a ustar archive into `root`.
///
/// Regular files and directories are materialized; other member kinds
/// (links, devices) are skipped. Returns the number of files created.
///
/// # Errors
///
/// `BadFormat` for a corrupt archive; creation errors pass through.
pub fn unpack(archive: &[u8], root: &Arc<Dentry>) -> Result<usize> {
    let mut files = 0;
    let iter = TarIter { archive, pos: 0 };
    for entry in iter {
        let entry = entry?;
        let name = entry.name.trim_end_matches('/');
        if name.is_empty() {
            continue;
        }
        match entry.kind {
            b'5' => {
                ensure_dirs(root, name)?;
            }
            0 | b'0' => {
                let (dir, file_name) = path::split_parent(name).ok_or(Error::BadFormat)?;
                let parent = ensure_dirs(root, dir)?;
                let dentry = match parent.find_child(file_name) {
                    Some(existing) => existing,
                    None => parent.ops().create_file(&parent, file_name)?,
                };
                let file = dentry.open()?;
                file.write_at(0, entry.data)?;
                files += 1;
            }
            _ => {}
        }
    }
    kinfo!("initrd: unpacked {files} files");
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::tmpfs;
    use boson_fs::vfs;

    /// Builds a ustar archive from `(name, kind, data)` members.
    fn tar(members: &[(&str, u8, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, kind, data) in members {
            let mut header = [0u8; TAR_BLOCK];
            header[..name.len()].copy_from_slice(name.as_bytes());
            let size = format!("{:011o}\0", data.len());
            header[OFF_SIZE..OFF_SIZE + 12].copy_from_slice(size.as_bytes());
            header[OFF_TYPE] = *kind;
            header[OFF_MAGIC..OFF_MAGIC + 6].copy_from_slice(b"ustar\0");
            out.extend_from_slice(&header);
            out.extend_from_slice(data);
            let pad = data.len().next_multiple_of(TAR_BLOCK) - data.len();
            out.extend(core::iter::repeat_n(0, pad));
        }
        out.extend_from_slice(&[0; 2 * TAR_BLOCK]);
        out
    }

    fn tmpfs_root() -> Arc<Dentry> {
        crate::test_support::install_frames();
        (tmpfs::TMPFS.mount)(None, None).unwrap().root()
    }

    #[test]
    fn unpacks_files_and_directories() {
        let root = tmpfs_root();
        let archive = tar(&[
            ("bin/", b'5', b""),
            ("bin/init", b'0', b"\x7fELF fake"),
            ("etc/motd", b'0', b"hello from the initrd\n"),
        ]);
        assert_eq!(unpack(&archive, &root).unwrap(), 2);

        let motd = vfs::resolve("etc/motd", Some(root.clone())).unwrap();
        let file = motd.open().unwrap();
        let mut buf = [0u8; 64];
        let n = file.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello from the initrd\n");

        let init = vfs::resolve("bin/init", Some(root)).unwrap();
        assert_eq!(init.inode().unwrap().size(), 9);
    }

    #[test]
    fn missing_parent_directories_are_created() {
        let root = tmpfs_root();
        let archive = tar(&[("deep/ly/nested/file", b'0', b"x")]);
        assert_eq!(unpack(&archive, &root).unwrap(), 1);
        assert!(vfs::resolve("deep/ly/nested/file", Some(root)).is_ok());
    }

    #[test]
    fn corrupt_magic_is_rejected() {
        let root = tmpfs_root();
        let mut archive = tar(&[("a", b'0', b"data")]);
        archive[OFF_MAGIC] = b'X';
        assert_eq!(unpack(&archive, &root).unwrap_err(), Error::BadFormat);
    }

    #[test]
    fn empty_archive_unpacks_nothing() {
        let root = tmpfs_root();
        assert_eq!(unpack(&[0u8; 1024], &root).unwrap(), 0);
    }
}
