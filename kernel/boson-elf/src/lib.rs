//! ELF64 parsing.
//!
//! Safe field extraction from raw byte slices; no pointer casts into the
//! input. The kernel's program loader consumes [`ElfFile`]; everything
//! here is pure and host-testable.

#![cfg_attr(not(test), no_std)]

pub mod header;
pub mod segment;

pub use header::{Elf64Header, ElfError, ElfType};
pub use segment::{PF_R, PF_W, PF_X, PT_DYNAMIC, PT_INTERP, PT_LOAD, ProgramHeader};

/// A parsed ELF64 image borrowing the raw file bytes.
pub struct ElfFile<'a> {
    data: &'a [u8],
    /// The validated file header.
    pub header: Elf64Header,
}

impl<'a> ElfFile<'a> {
    /// Parses and validates the image.
    ///
    /// # Errors
    ///
    /// See [`Elf64Header::parse`].
    pub fn parse(data: &'a [u8]) -> Result<Self, ElfError> {
        let header = Elf64Header::parse(data)?;
        Ok(Self { data, header })
    }

    /// Virtual entry point (file-relative for `Dyn` images).
    #[must_use]
    pub fn entry_point(&self) -> u64 {
        self.header.e_entry
    }

    /// Whether the image is position-independent.
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.header.e_type == ElfType::Dyn
    }

    /// Iterates all program headers.
    pub fn program_headers(&self) -> impl Iterator<Item = ProgramHeader> + '_ {
        let phoff = self.header.e_phoff as usize;
        let phentsize = self.header.e_phentsize as usize;
        (0..self.header.e_phnum as usize).map(move |i| {
            let off = phoff + i * phentsize;
            // Bounds were validated by Elf64Header::parse.
            ProgramHeader::parse(&self.data[off..off + segment::ELF64_PHDR_SIZE])
        })
    }

    /// Iterates the loadable segments.
    pub fn load_segments(&self) -> impl Iterator<Item = ProgramHeader> + '_ {
        self.program_headers().filter(|ph| ph.p_type == PT_LOAD)
    }

    /// File bytes of a segment.
    ///
    /// # Errors
    ///
    /// `Truncated` if the segment points outside the file.
    pub fn segment_data(&self, ph: &ProgramHeader) -> Result<&'a [u8], ElfError> {
        let start = ph.p_offset as usize;
        let end = start
            .checked_add(ph.p_filesz as usize)
            .ok_or(ElfError::InvalidOffset)?;
        self.data.get(start..end).ok_or(ElfError::Truncated)
    }

    /// Interpreter path from `PT_INTERP`, without the trailing NUL.
    ///
    /// Returns `None` when the image is static.
    ///
    /// # Errors
    ///
    /// `BadInterpreter` if the segment is malformed or not UTF-8.
    pub fn interpreter(&self) -> Result<Option<&'a str>, ElfError> {
        let Some(ph) = self.program_headers().find(|ph| ph.p_type == PT_INTERP) else {
            return Ok(None);
        };
        let raw = self.segment_data(&ph).map_err(|_| ElfError::BadInterpreter)?;
        let no_nul = match raw.split_last() {
            Some((0, rest)) => rest,
            _ => return Err(ElfError::BadInterpreter),
        };
        core::str::from_utf8(no_nul)
            .map(Some)
            .map_err(|_| ElfError::BadInterpreter)
    }

    /// Span of the loadable image: lowest and one-past-highest virtual
    /// addresses, page-unaligned.
    #[must_use]
    pub fn load_span(&self) -> Option<(u64, u64)> {
        let mut lo = u64::MAX;
        let mut hi = 0;
        for ph in self.load_segments() {
            lo = lo.min(ph.p_vaddr);
            hi = hi.max(ph.p_vaddr + ph.p_memsz);
        }
        (lo <= hi && hi != 0).then_some((lo, hi))
    }

    /// Largest segment alignment among the loadable segments.
    #[must_use]
    pub fn max_align(&self) -> u64 {
        self.load_segments()
            .map(|ph| ph.p_align.max(1))
            .max()
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_image::TestImage;

    #[test]
    fn parses_minimal_exec() {
        let image = TestImage::new(header::ET_EXEC).with_load(0x400000, b"code", 0x1000);
        let bytes = image.build();
        let elf = ElfFile::parse(&bytes).unwrap();
        assert!(!elf.is_dynamic());
        assert_eq!(elf.load_segments().count(), 1);
        let seg = elf.load_segments().next().unwrap();
        assert_eq!(elf.segment_data(&seg).unwrap(), b"code");
    }

    #[test]
    fn dynamic_with_interpreter() {
        let image = TestImage::new(header::ET_DYN)
            .with_interp(b"/lib/ld-musl-x86_64.so.1\0")
            .with_load(0, b"text", 0x1000);
        let bytes = image.build();
        let elf = ElfFile::parse(&bytes).unwrap();
        assert!(elf.is_dynamic());
        assert_eq!(elf.interpreter().unwrap(), Some("/lib/ld-musl-x86_64.so.1"));
    }

    #[test]
    fn interpreter_requires_nul() {
        let image = TestImage::new(header::ET_DYN)
            .with_interp(b"/lib/ld.so")
            .with_load(0, b"text", 0x1000);
        let bytes = image.build();
        let elf = ElfFile::parse(&bytes).unwrap();
        assert_eq!(elf.interpreter().unwrap_err(), ElfError::BadInterpreter);
    }

    #[test]
    fn load_span_covers_bss() {
        let image = TestImage::new(header::ET_EXEC).with_load_memsz(0x400000, b"data", 0x100, 0x1000);
        let bytes = image.build();
        let elf = ElfFile::parse(&bytes).unwrap();
        let (lo, hi) = elf.load_span().unwrap();
        assert_eq!(lo, 0x400000);
        assert_eq!(hi, 0x400100);
    }
}

/// Synthetic ELF image builder for the unit tests.
#[cfg(test)]
pub(crate) mod test_image {
    use crate::header::{self, ELF64_EHDR_SIZE};
    use crate::segment::{ELF64_PHDR_SIZE, PT_INTERP, PT_LOAD};

    pub struct TestImage {
        e_type: u16,
        segments: Vec<(u32, u64, Vec<u8>, u64, u64)>,
    }

    impl TestImage {
        pub fn new(e_type: u16) -> Self {
            Self {
                e_type,
                segments: Vec::new(),
            }
        }

        pub fn with_load(self, vaddr: u64, data: &[u8], align: u64) -> Self {
            let memsz = data.len() as u64;
            self.push(PT_LOAD, vaddr, data.to_vec(), memsz, align)
        }

        pub fn with_load_memsz(self, vaddr: u64, data: &[u8], memsz: u64, align: u64) -> Self {
            self.push(PT_LOAD, vaddr, data.to_vec(), memsz, align)
        }

        pub fn with_interp(self, path: &[u8]) -> Self {
            let len = path.len() as u64;
            self.push(PT_INTERP, 0, path.to_vec(), len, 1)
        }

        fn push(mut self, p_type: u32, vaddr: u64, data: Vec<u8>, memsz: u64, align: u64) -> Self {
            self.segments.push((p_type, vaddr, data, memsz, align));
            self
        }

        pub fn build(&self) -> Vec<u8> {
            let phnum = self.segments.len();
            let phoff = ELF64_EHDR_SIZE;
            let mut data_off = phoff + phnum * ELF64_PHDR_SIZE;
            let mut out = vec![0u8; data_off];

            // File header.
            out[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
            out[4] = 2; // ELFCLASS64
            out[5] = 1; // little-endian
            out[6] = 1; // EV_CURRENT
            out[7] = 0; // SYSV OS/ABI
            out[16..18].copy_from_slice(&self.e_type.to_le_bytes());
            out[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
            out[24..32].copy_from_slice(&0x400078u64.to_le_bytes()); // e_entry
            out[32..40].copy_from_slice(&(phoff as u64).to_le_bytes());
            out[52..54].copy_from_slice(&(ELF64_EHDR_SIZE as u16).to_le_bytes());
            out[54..56].copy_from_slice(&(ELF64_PHDR_SIZE as u16).to_le_bytes());
            out[56..58].copy_from_slice(&(phnum as u16).to_le_bytes());

            // Program headers + segment payloads.
            for (i, (p_type, vaddr, data, memsz, align)) in self.segments.iter().enumerate() {
                let ph = phoff + i * ELF64_PHDR_SIZE;
                out[ph..ph + 4].copy_from_slice(&p_type.to_le_bytes());
                out[ph + 4..ph + 8].copy_from_slice(&(header::test_flags()).to_le_bytes());
                out[ph + 8..ph + 16].copy_from_slice(&(data_off as u64).to_le_bytes());
                out[ph + 16..ph + 24].copy_from_slice(&vaddr.to_le_bytes());
                out[ph + 32..ph + 40].copy_from_slice(&(data.len() as u64).to_le_bytes());
                out[ph + 40..ph + 48].copy_from_slice(&memsz.to_le_bytes());
                out[ph + 48..ph + 56].copy_from_slice(&align.to_le_bytes());
                out.extend_from_slice(data);
                data_off += data.len();
            }
            out
        }
    }
}
