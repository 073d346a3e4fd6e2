//! GUID partition table probing.
//!
//! The header lives at LBA 1; entries with an all-zero type GUID
//! terminate the array. Probing is idempotent: a drive that already
//! carries more than its base partition is left untouched.

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use boson_core::{Error, Result, kdebug};

use crate::drive::{Drive, DriveFlags, Partition};

/// "EFI PART" signature at the start of the header.
const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";

/// Byte offset of the partition-entry LBA field in the header.
const HDR_ENTRIES_LBA: usize = 72;
/// Byte offset of the entry-count field.
const HDR_ENTRY_COUNT: usize = 80;
/// Byte offset of the entry-size field.
const HDR_ENTRY_SIZE: usize = 84;

/// Byte offset of an entry's first-LBA field.
const ENT_FIRST_LBA: usize = 32;
/// Byte offset of an entry's last-LBA field (inclusive).
const ENT_LAST_LBA: usize = 40;

fn le_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(*data[off..].first_chunk().expect("bounds checked by caller"))
}

fn le_u64(data: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(*data[off..].first_chunk().expect("bounds checked by caller"))
}

/// Device-node name for partition `index` of `drive_name`.
///
/// `sda` → `sda1`; a name ending in a digit gets a `p` separator:
/// `nvme0` → `nvme0p1`.
#[must_use]
pub fn partition_device_name(drive_name: &str, index: u32) -> String {
    if drive_name.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{drive_name}p{index}")
    } else {
        format!("{drive_name}{index}")
    }
}

/// Probes the drive for a GPT and appends the discovered partitions.
///
/// Returns the newly created partitions (empty when the drive already
/// has partitions beyond the base one, or carries no GPT signature).
///
/// # Errors
///
/// `BadFormat` for a malformed header, I/O errors from the cache reads.
pub fn probe(drive: &Arc<Drive>) -> Result<Vec<Arc<Partition>>> {
    if !drive.flags().contains(DriveFlags::PARTITIONABLE) {
        return Err(Error::BadOperation);
    }
    // Idempotence: only the base partition may be present.
    if drive.partitions().len() > 1 {
        return Ok(Vec::new());
    }

    let lba_bytes = drive.lba_size() as u64;
    let header = drive.read_bytes(lba_bytes, drive.lba_size() as usize)?;
    if header[..8] != GPT_SIGNATURE {
        // Not GPT-formatted; perfectly legal.
        return Ok(Vec::new());
    }

    let entries_lba = le_u64(&header, HDR_ENTRIES_LBA);
    let entry_count = le_u32(&header, HDR_ENTRY_COUNT);
    let entry_size = le_u32(&header, HDR_ENTRY_SIZE) as usize;
    if entry_size < 128 || entries_lba == 0 {
        return Err(Error::BadFormat);
    }

    let table = drive.read_bytes(entries_lba * lba_bytes, entry_count as usize * entry_size)?;

    let mut created = Vec::new();
    for slot in 0..entry_count as usize {
        let entry = &table[slot * entry_size..(slot + 1) * entry_size];
        // An all-zero type GUID terminates the array.
        if entry[..16].iter().all(|&b| b == 0) {
            break;
        }
        let first_lba = le_u64(entry, ENT_FIRST_LBA);
        let last_lba = le_u64(entry, ENT_LAST_LBA);
        if last_lba < first_lba {
            return Err(Error::BadFormat);
        }
        let index = created.len() as u32 + 1;
        let partition = Arc::new(Partition {
            index,
            first_lba,
            lba_count: last_lba - first_lba + 1,
            name: partition_device_name(drive.name(), index),
        });
        drive.add_partition(partition.clone());
        created.push(partition);
    }

    kdebug!("{}: GPT probe found {} partitions", drive.name(), created.len());
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::{DriveIo, IoOperation, IoRequest, IoStatus};
    use crate::test_support;
    use std::sync::Mutex;

    struct GptDisk {
        store: Mutex<Vec<u8>>,
    }

    impl DriveIo for GptDisk {
        fn handle_io(&self, drive: &Drive, request: &IoRequest) -> bool {
            let offset = request.lba as usize * 512;
            let len = request.lba_count as usize * 512;
            {
                let store = self.store.lock().unwrap();
                assert_eq!(request.operation, IoOperation::Read);
                // SAFETY: The submitter's buffer covers `len` bytes.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        store[offset..].as_ptr(),
                        request.buffer,
                        len,
                    );
                }
            }
            drive.complete_io(request.id, IoStatus::Success);
            true
        }
    }

    /// Builds a disk image with a GPT header and `parts` entries.
    fn gpt_image(parts: &[(u64, u64)]) -> Vec<u8> {
        let mut image = vec![0u8; 1 << 20];
        // Header at LBA 1.
        let hdr = 512;
        image[hdr..hdr + 8].copy_from_slice(b"EFI PART");
        image[hdr + HDR_ENTRIES_LBA..hdr + HDR_ENTRIES_LBA + 8]
            .copy_from_slice(&2u64.to_le_bytes());
        image[hdr + HDR_ENTRY_COUNT..hdr + HDR_ENTRY_COUNT + 4]
            .copy_from_slice(&16u32.to_le_bytes());
        image[hdr + HDR_ENTRY_SIZE..hdr + HDR_ENTRY_SIZE + 4]
            .copy_from_slice(&128u32.to_le_bytes());
        // Entries at LBA 2.
        for (i, &(first, last)) in parts.iter().enumerate() {
            let base = 1024 + i * 128;
            // Any non-zero type GUID marks the entry as used.
            image[base] = 0xAB;
            image[base + ENT_FIRST_LBA..base + ENT_FIRST_LBA + 8]
                .copy_from_slice(&first.to_le_bytes());
            image[base + ENT_LAST_LBA..base + ENT_LAST_LBA + 8]
                .copy_from_slice(&last.to_le_bytes());
        }
        image
    }

    fn mkdrive(name: &str, image: Vec<u8>) -> Arc<Drive> {
        test_support::install_frames();
        let capacity = image.len() as u64;
        Drive::new(
            String::from(name),
            512,
            capacity,
            DriveFlags::PARTITIONABLE,
            Arc::new(GptDisk {
                store: Mutex::new(image),
            }),
        )
    }

    #[test]
    fn probe_creates_three_partitions_plus_base() {
        let _gate = test_support::current_gate();
        let drive = mkdrive("vda", gpt_image(&[(64, 127), (128, 255), (256, 511)]));
        let created = probe(&drive).unwrap();
        assert_eq!(created.len(), 3);
        let parts = drive.partitions();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].index, 0);
        assert_eq!(parts[1].name, "vda1");
        assert_eq!(parts[2].name, "vda2");
        assert_eq!(parts[3].name, "vda3");
        assert_eq!(parts[2].first_lba, 128);
        assert_eq!(parts[2].lba_count, 128);
    }

    #[test]
    fn probe_twice_is_a_noop() {
        let _gate = test_support::current_gate();
        let drive = mkdrive("vdb", gpt_image(&[(64, 127), (128, 255), (256, 511)]));
        assert_eq!(probe(&drive).unwrap().len(), 3);
        assert_eq!(probe(&drive).unwrap().len(), 0);
        assert_eq!(drive.partitions().len(), 4);
    }

    #[test]
    fn digit_suffixed_drives_get_p_separator() {
        assert_eq!(partition_device_name("nvme0", 2), "nvme0p2");
        assert_eq!(partition_device_name("sda", 2), "sda2");
    }

    #[test]
    fn non_gpt_drive_yields_no_partitions() {
        let _gate = test_support::current_gate();
        let drive = mkdrive("vdc", vec![0u8; 1 << 20]);
        assert_eq!(probe(&drive).unwrap().len(), 0);
        assert_eq!(drive.partitions().len(), 1);
    }
}
