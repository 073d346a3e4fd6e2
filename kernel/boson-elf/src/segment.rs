//! ELF64 program header parsing.

use crate::header::{le_u32, le_u64};

/// Loadable segment.
pub const PT_LOAD: u32 = 1;

/// Dynamic linking information.
pub const PT_DYNAMIC: u32 = 2;

/// Interpreter path.
pub const PT_INTERP: u32 = 3;

/// Executable segment flag.
pub const PF_X: u32 = 1;

/// Writable segment flag.
pub const PF_W: u32 = 2;

/// Readable segment flag.
pub const PF_R: u32 = 4;

/// Size of one ELF64 program header entry.
pub(crate) const ELF64_PHDR_SIZE: usize = 56;

/// One program header entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    /// Segment type (`PT_*`).
    pub p_type: u32,
    /// Permission flags (`PF_*`).
    pub p_flags: u32,
    /// File offset of the segment payload.
    pub p_offset: u64,
    /// Virtual load address.
    pub p_vaddr: u64,
    /// Bytes present in the file.
    pub p_filesz: u64,
    /// Bytes occupied in memory (`>= p_filesz`; the gap is zeroed).
    pub p_memsz: u64,
    /// Required alignment.
    pub p_align: u64,
}

impl ProgramHeader {
    /// Parses one entry from exactly [`ELF64_PHDR_SIZE`] bytes.
    #[must_use]
    pub(crate) fn parse(data: &[u8]) -> Self {
        debug_assert!(data.len() >= ELF64_PHDR_SIZE);
        Self {
            p_type: le_u32(data, 0),
            p_flags: le_u32(data, 4),
            p_offset: le_u64(data, 8),
            p_vaddr: le_u64(data, 16),
            p_filesz: le_u64(data, 32),
            p_memsz: le_u64(data, 40),
            p_align: le_u64(data, 48),
        }
    }

    /// Whether the segment requests read permission.
    #[must_use]
    pub fn readable(&self) -> bool {
        self.p_flags & PF_R != 0
    }

    /// Whether the segment requests write permission.
    #[must_use]
    pub fn writable(&self) -> bool {
        self.p_flags & PF_W != 0
    }

    /// Whether the segment requests execute permission.
    #[must_use]
    pub fn executable(&self) -> bool {
        self.p_flags & PF_X != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ElfFile;
    use crate::test_image::TestImage;

    #[test]
    fn fields_roundtrip_through_builder() {
        let bytes = TestImage::new(crate::header::ET_EXEC)
            .with_load_memsz(0x400000, b"abcd", 0x2000, 0x1000)
            .build();
        let elf = ElfFile::parse(&bytes).unwrap();
        let seg = elf.load_segments().next().unwrap();
        assert_eq!(seg.p_vaddr, 0x400000);
        assert_eq!(seg.p_filesz, 4);
        assert_eq!(seg.p_memsz, 0x2000);
        assert_eq!(seg.p_align, 0x1000);
        assert!(seg.readable());
        assert!(seg.executable());
        assert!(!seg.writable());
    }
}
