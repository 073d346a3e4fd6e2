//! ELF64 file header parsing and validation.

use core::fmt;

/// `\x7fELF` magic.
const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// 64-bit class byte.
const ELFCLASS64: u8 = 2;

/// Little-endian data encoding.
const ELFDATA2LSB: u8 = 1;

/// System V OS/ABI.
const ELFOSABI_SYSV: u8 = 0;

/// GNU/Linux OS/ABI.
const ELFOSABI_GNU: u8 = 3;

/// Relocatable object file.
pub(crate) const ET_REL: u16 = 1;

/// Executable with fixed load addresses.
pub(crate) const ET_EXEC: u16 = 2;

/// Position-independent executable / shared object.
pub(crate) const ET_DYN: u16 = 3;

/// x86-64 machine id.
const EM_X86_64: u16 = 62;

/// Size of the ELF64 file header.
pub(crate) const ELF64_EHDR_SIZE: usize = 64;

/// Read a little-endian `u16` at `off`. Callers bounds-check first.
pub(crate) fn le_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(*data[off..].first_chunk().expect("caller checked bounds"))
}

/// Read a little-endian `u32` at `off`.
pub(crate) fn le_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(*data[off..].first_chunk().expect("caller checked bounds"))
}

/// Read a little-endian `u64` at `off`.
pub(crate) fn le_u64(data: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(*data[off..].first_chunk().expect("caller checked bounds"))
}

/// ELF parse/validation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// Missing `\x7fELF` magic.
    BadMagic,
    /// Not a 64-bit little-endian image.
    BadClass,
    /// The OS/ABI is neither System V nor GNU.
    BadAbi,
    /// The machine is not x86-64.
    BadMachine,
    /// The type is not EXEC, DYN, or REL.
    BadType,
    /// Input shorter than a declared structure.
    Truncated,
    /// A header offset or size points outside the file.
    InvalidOffset,
    /// `PT_INTERP` is malformed.
    BadInterpreter,
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BadMagic => "bad ELF magic",
            Self::BadClass => "not a 64-bit little-endian ELF",
            Self::BadAbi => "unsupported OS/ABI",
            Self::BadMachine => "unsupported machine",
            Self::BadType => "unsupported ELF type",
            Self::Truncated => "truncated ELF image",
            Self::InvalidOffset => "header offset out of bounds",
            Self::BadInterpreter => "malformed PT_INTERP",
        };
        f.write_str(s)
    }
}

/// Image linkage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfType {
    /// Relocatable object.
    Rel,
    /// Fixed-address executable.
    Exec,
    /// Position-independent executable.
    Dyn,
}

/// Validated ELF64 file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64Header {
    /// Linkage type.
    pub e_type: ElfType,
    /// Entry point virtual address.
    pub e_entry: u64,
    /// Program header table file offset.
    pub e_phoff: u64,
    /// Program header entry size.
    pub e_phentsize: u16,
    /// Program header entry count.
    pub e_phnum: u16,
}

impl Elf64Header {
    /// Parses and validates a file header.
    ///
    /// Checks magic, class, endianness, OS/ABI (SYSV or GNU), machine,
    /// type, and that the program header table lies within `data`.
    ///
    /// # Errors
    ///
    /// Returns the specific [`ElfError`] for the first failed check.
    pub fn parse(data: &[u8]) -> Result<Self, ElfError> {
        if data.len() < ELF64_EHDR_SIZE {
            return Err(ElfError::Truncated);
        }
        if data[..4] != ELF_MAGIC {
            return Err(ElfError::BadMagic);
        }
        if data[4] != ELFCLASS64 || data[5] != ELFDATA2LSB {
            return Err(ElfError::BadClass);
        }
        if data[7] != ELFOSABI_SYSV && data[7] != ELFOSABI_GNU {
            return Err(ElfError::BadAbi);
        }

        let e_type = match le_u16(data, 16) {
            ET_REL => ElfType::Rel,
            ET_EXEC => ElfType::Exec,
            ET_DYN => ElfType::Dyn,
            _ => return Err(ElfError::BadType),
        };
        if le_u16(data, 18) != EM_X86_64 {
            return Err(ElfError::BadMachine);
        }

        let e_entry = le_u64(data, 24);
        let e_phoff = le_u64(data, 32);
        let e_phentsize = le_u16(data, 54);
        let e_phnum = le_u16(data, 56);

        if e_phnum > 0 {
            if (e_phentsize as usize) < crate::segment::ELF64_PHDR_SIZE {
                return Err(ElfError::InvalidOffset);
            }
            let table_end = e_phoff
                .checked_add(e_phnum as u64 * e_phentsize as u64)
                .ok_or(ElfError::InvalidOffset)?;
            if table_end > data.len() as u64 {
                return Err(ElfError::Truncated);
            }
        }

        Ok(Self {
            e_type,
            e_entry,
            e_phoff,
            e_phentsize,
            e_phnum,
        })
    }
}

/// Segment flags used by the synthetic test images (R+X).
#[cfg(test)]
pub(crate) fn test_flags() -> u32 {
    crate::segment::PF_R | crate::segment::PF_X
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_image::TestImage;

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = TestImage::new(ET_EXEC).build();
        bytes[0] = 0;
        assert_eq!(Elf64Header::parse(&bytes).unwrap_err(), ElfError::BadMagic);
    }

    #[test]
    fn rejects_wrong_class_and_endianness() {
        let mut bytes = TestImage::new(ET_EXEC).build();
        bytes[4] = 1; // ELFCLASS32
        assert_eq!(Elf64Header::parse(&bytes).unwrap_err(), ElfError::BadClass);
        bytes[4] = 2;
        bytes[5] = 2; // big-endian
        assert_eq!(Elf64Header::parse(&bytes).unwrap_err(), ElfError::BadClass);
    }

    #[test]
    fn rejects_foreign_abi_but_accepts_gnu() {
        let mut bytes = TestImage::new(ET_EXEC).build();
        bytes[7] = 3; // GNU
        assert!(Elf64Header::parse(&bytes).is_ok());
        bytes[7] = 9; // FreeBSD
        assert_eq!(Elf64Header::parse(&bytes).unwrap_err(), ElfError::BadAbi);
    }

    #[test]
    fn rejects_unknown_type() {
        let mut bytes = TestImage::new(4).build(); // ET_CORE
        bytes[7] = 0;
        assert_eq!(Elf64Header::parse(&bytes).unwrap_err(), ElfError::BadType);
    }

    #[test]
    fn accepts_rel_objects() {
        let bytes = TestImage::new(ET_REL).build();
        let hdr = Elf64Header::parse(&bytes).unwrap();
        assert_eq!(hdr.e_type, ElfType::Rel);
    }

    #[test]
    fn truncated_table_is_rejected() {
        let mut bytes = TestImage::new(ET_EXEC).with_load(0x1000, b"x", 0x1000).build();
        // Claim more program headers than the file holds.
        bytes[56..58].copy_from_slice(&64u16.to_le_bytes());
        assert_eq!(Elf64Header::parse(&bytes).unwrap_err(), ElfError::Truncated);
    }
}
