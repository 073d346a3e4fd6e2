//! ELF program loading.
//!
//! Maps a validated ELF image into a process address space as file-backed
//! map units (zero gaps as anonymous units), places the dynamic
//! interpreter when one is named, builds the initial user stack with
//! argv/envp and the auxiliary vector, and reports the entry context.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use boson_core::{Error, Result, kdebug};
use boson_elf::{ElfError, ElfFile};
use boson_fs::file::File;
use boson_mm::frames::PAGE_SIZE;

use crate::config::{
    DEFAULT_VIRT_BASE, UNAME_MACHINE, USER_MMAP_BASE, USER_STACK_SIZE, USER_STACK_TOP,
};
use crate::mm::addr_space::{AddressSpace, MapFlags, PageMapper};
use crate::proc::Process;
use crate::proc::random::Xoroshiro128;

// Auxiliary vector tags (System V x86-64 ABI).
const AT_NULL: u64 = 0;
const AT_PHDR: u64 = 3;
const AT_PHENT: u64 = 4;
const AT_PHNUM: u64 = 5;
const AT_PAGESZ: u64 = 6;
const AT_BASE: u64 = 7;
const AT_ENTRY: u64 = 9;
const AT_UID: u64 = 11;
const AT_EUID: u64 = 12;
const AT_GID: u64 = 13;
const AT_EGID: u64 = 14;
const AT_PLATFORM: u64 = 15;
const AT_SECURE: u64 = 23;
const AT_RANDOM: u64 = 25;
const AT_EXECFN: u64 = 31;

const PAGE: u64 = PAGE_SIZE as u64;

/// Result of loading a program.
#[derive(Debug)]
pub struct LoadedImage {
    /// First instruction to execute (interpreter entry when present).
    pub entry: u64,
    /// Load base of the executable itself.
    pub exe_base: u64,
    /// Load base of the interpreter, when one was mapped.
    pub interp_base: Option<u64>,
    /// Initial user stack pointer (points at `argc`).
    pub stack_pointer: u64,
    /// Top of the stack reservation.
    pub stack_top: u64,
}

fn elf_error(e: ElfError) -> Error {
    match e {
        ElfError::BadAbi => Error::BadAbi,
        ElfError::BadInterpreter => Error::BadInterpreter,
        _ => Error::BadFormat,
    }
}

fn align_down(v: u64) -> u64 {
    v & !(PAGE - 1)
}

fn align_up(v: u64) -> u64 {
    (v + PAGE - 1) & !(PAGE - 1)
}

fn read_whole_file(file: &Arc<File>) -> Result<Vec<u8>> {
    let inode = file.dentry.inode().ok_or(Error::BadInode)?;
    let mut data = vec![0u8; inode.size() as usize];
    let mut done = 0;
    while done < data.len() {
        let n = file.read_at(done as u64, &mut data[done..])?;
        if n == 0 {
            return Err(Error::BadFormat);
        }
        done += n;
    }
    Ok(data)
}

fn segment_flags(ph: &boson_elf::ProgramHeader) -> MapFlags {
    let mut flags = MapFlags::USER;
    if ph.readable() {
        flags |= MapFlags::READ;
    }
    if ph.writable() {
        flags |= MapFlags::WRITE;
    }
    if ph.executable() {
        flags |= MapFlags::EXEC;
    }
    flags
}

/// Maps every `PT_LOAD` of `elf` at `base`, backing file pages with the
/// executable and zero gaps with anonymous units. Returns one past the
/// highest mapped address.
fn map_segments<M: PageMapper>(
    space: &AddressSpace<M>,
    elf: &ElfFile<'_>,
    file: &Arc<File>,
    base: u64,
) -> Result<u64> {
    let mut image_end = 0;
    for ph in elf.load_segments() {
        if ph.p_vaddr % PAGE != ph.p_offset % PAGE {
            return Err(Error::BadFormat);
        }
        let flags = segment_flags(&ph);
        let seg_start = align_down(ph.p_vaddr);
        let file_end = align_up(ph.p_vaddr + ph.p_filesz);
        let mem_end = align_up(ph.p_vaddr + ph.p_memsz);

        if file_end > seg_start {
            space.map_file(
                base + seg_start,
                file_end - seg_start,
                flags,
                file.clone(),
                align_down(ph.p_offset) / PAGE,
            )?;
        }
        // p_memsz > p_filesz: zero-fill the gap with anonymous pages.
        if mem_end > file_end {
            space.map_anonymous(base + file_end, mem_end - file_end, flags, false)?;
        }
        image_end = image_end.max(base + mem_end);
    }
    if image_end == 0 {
        return Err(Error::BadFormat);
    }
    Ok(image_end)
}

/// Stack builder: pushes strings downward, then the pointer block.
struct StackBuilder<'a, M: PageMapper> {
    space: &'a AddressSpace<M>,
    sp: u64,
}

impl<'a, M: PageMapper> StackBuilder<'a, M> {
    fn push_bytes(&mut self, bytes: &[u8]) -> Result<u64> {
        self.sp -= bytes.len() as u64;
        self.space.copy_to_user(self.sp, bytes)?;
        Ok(self.sp)
    }

    fn push_str(&mut self, s: &str) -> Result<u64> {
        self.sp -= 1;
        self.space.copy_to_user(self.sp, &[0])?;
        self.push_bytes(s.as_bytes())
    }
}

/// Loads `exe` into `process`, resolving the interpreter through
/// `resolve`. Returns the initial execution context.
///
/// # Errors
///
/// `BadFormat` / `BadAbi` for a rejected image, `BadInterpreter` when the
/// named interpreter cannot be resolved or parsed, plus allocation and
/// I/O errors from mapping.
pub fn load_with<M, F>(
    space: &AddressSpace<M>,
    process: &Process,
    exe: Arc<File>,
    args: &[&str],
    envs: &[&str],
    resolve: F,
) -> Result<LoadedImage>
where
    M: PageMapper,
    F: FnOnce(&str) -> Result<Arc<File>>,
{
    let exe_data = read_whole_file(&exe)?;
    let elf = ElfFile::parse(&exe_data).map_err(elf_error)?;

    // DYN images relocate to the default base; EXEC maps in place.
    let exe_base = if elf.is_dynamic() { DEFAULT_VIRT_BASE } else { 0 };
    let image_end = map_segments(space, &elf, &exe, exe_base)?;

    // The heap follows the last loaded segment, page aligned.
    {
        let mut heap = process.heap.lock();
        heap.base = align_up(image_end);
        heap.end = heap.base;
    }

    // Interpreter placement: find a hole sized and aligned for it.
    let mut interp_base = None;
    let mut interp_entry = None;
    if let Some(path) = elf.interpreter().map_err(elf_error)? {
        let interp_file = resolve(path).map_err(|_| Error::BadInterpreter)?;
        let interp_data = read_whole_file(&interp_file)?;
        let interp_elf = ElfFile::parse(&interp_data).map_err(|_| Error::BadInterpreter)?;
        let (lo, hi) = interp_elf.load_span().ok_or(Error::BadInterpreter)?;
        let span = align_up(hi) - align_down(lo);
        let base = space.find_free_range(USER_MMAP_BASE, span, interp_elf.max_align())?;
        map_segments(space, &interp_elf, &interp_file, base)?;
        kdebug!("interp '{}' at {:#x}", path, base);
        interp_base = Some(base);
        interp_entry = Some(base + interp_elf.entry_point());
    }

    // Stack region, growing down.
    let stack_bottom = USER_STACK_TOP - USER_STACK_SIZE;
    space.map_anonymous(
        stack_bottom,
        USER_STACK_SIZE,
        MapFlags::READ | MapFlags::WRITE | MapFlags::USER,
        true,
    )?;

    // Strings first, from the top down.
    let mut builder = StackBuilder {
        space,
        sp: USER_STACK_TOP,
    };
    let execfn = args.first().copied().unwrap_or("");
    let execfn_addr = builder.push_str(execfn)?;
    let platform_addr = builder.push_str(UNAME_MACHINE)?;

    let mut random_bytes = [0u8; 16];
    let mut rng =
        Xoroshiro128::seeded(crate::time::uptime_ticks() ^ (u64::from(process.pid) << 32));
    rng.fill_bytes(&mut random_bytes);
    let random_addr = builder.push_bytes(&random_bytes)?;

    let mut env_addrs = Vec::with_capacity(envs.len());
    for env in envs.iter().rev() {
        env_addrs.push(builder.push_str(env)?);
    }
    env_addrs.reverse();
    let mut arg_addrs = Vec::with_capacity(args.len());
    for arg in args.iter().rev() {
        arg_addrs.push(builder.push_str(arg)?);
    }
    arg_addrs.reverse();

    // The auxiliary vector.
    let auxv: [(u64, u64); 15] = [
        (AT_PAGESZ, PAGE),
        (AT_BASE, interp_base.unwrap_or(exe_base)),
        (AT_ENTRY, exe_base + elf.entry_point()),
        (AT_PHDR, exe_base + elf.header.e_phoff),
        (AT_PHNUM, u64::from(elf.header.e_phnum)),
        (AT_PHENT, u64::from(elf.header.e_phentsize)),
        (AT_UID, u64::from(process.creds.uid)),
        (AT_EUID, u64::from(process.creds.uid)),
        (AT_GID, u64::from(process.creds.gid)),
        (AT_EGID, u64::from(process.creds.gid)),
        (AT_SECURE, 0),
        (AT_RANDOM, random_addr),
        (AT_EXECFN, execfn_addr),
        (AT_PLATFORM, platform_addr),
        (AT_NULL, 0),
    ];

    // Pointer block: argc, argv..., NULL, envp..., NULL, auxv pairs.
    let mut block: Vec<u64> = Vec::new();
    block.push(args.len() as u64);
    block.extend_from_slice(&arg_addrs);
    block.push(0);
    block.extend_from_slice(&env_addrs);
    block.push(0);
    for (tag, value) in auxv {
        block.push(tag);
        block.push(value);
    }

    // Place the block so the final stack pointer is 16-byte aligned.
    let block_bytes = block.len() as u64 * 8;
    let sp = (builder.sp - block_bytes) & !15;
    let mut encoded = Vec::with_capacity(block.len() * 8);
    for word in &block {
        encoded.extend_from_slice(&word.to_le_bytes());
    }
    space.copy_to_user(sp, &encoded)?;

    let entry = interp_entry.unwrap_or(exe_base + elf.entry_point());
    kdebug!(
        "exec: entry {:#x}, base {:#x}, sp {:#x}",
        entry,
        exe_base,
        sp
    );

    Ok(LoadedImage {
        entry,
        exe_base,
        interp_base,
        stack_pointer: sp,
        stack_top: USER_STACK_TOP,
    })
}

/// Loads `exe` into `process`, resolving the interpreter through the
/// process's root directory in the VFS.
///
/// # Errors
///
/// See [`load_with`].
pub fn load(
    process: &Process,
    exe: Arc<File>,
    args: &[&str],
    envs: &[&str],
) -> Result<LoadedImage> {
    let root = process.root.lock().clone();
    load_with(process.space(), process, exe, args, envs, |path| {
        let dentry = boson_fs::vfs::resolve(path, root)?;
        dentry.open()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::addr_space::HostMapper;
    use crate::mm::hhdm;
    use crate::proc::Credentials;
    use alloc::sync::Weak;
    use boson_fs::dentry::{Dentry, DentryOps};
    use boson_fs::file::{FileOps, OpenFlags};
    use boson_fs::inode::{Inode, InodeType};
    use boson_mm::cache::CacheBlock;
    use std::sync::Mutex;

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

    /// File ops over an owned byte image.
    struct MemFileOps {
        image: Mutex<Vec<u8>>,
    }

    impl FileOps for MemFileOps {
        fn read(&self, _f: &File, offset: u64, buf: &mut [u8]) -> Result<usize> {
            let image = self.image.lock().unwrap();
            let offset = offset as usize;
            if offset >= image.len() {
                return Ok(0);
            }
            let take = buf.len().min(image.len() - offset);
            buf[..take].copy_from_slice(&image[offset..offset + take]);
            Ok(take)
        }
        fn mmap_block(&self, file: &File, block_index: u32) -> Result<Arc<CacheBlock>> {
            let inode = file.dentry.inode().ok_or(Error::BadInode)?;
            if let Some(hit) = inode.cache.get(block_index) {
                return Ok(hit);
            }
            let block = inode.cache.create_block(block_index)?;
            let image = self.image.lock().unwrap();
            let start = block_index as usize * block.size().bytes();
            if start < image.len() {
                let end = (start + block.size().bytes()).min(image.len());
                block.fill(&image[start..end]);
            }
            Ok(inode.cache.insert_or_free(block))
        }
    }

    fn mem_file(image: Vec<u8>) -> Arc<File> {
        let ops: &'static MemFileOps = Box::leak(Box::new(MemFileOps {
            image: Mutex::new(image),
        }));
        let inode = Inode::new(90, InodeType::RegularFile, 0o755);
        inode.set_size(ops.image.lock().unwrap().len() as u64);
        let dentry = Dentry::new("exe", Weak::new(), &ND, Some(inode));
        File::new(dentry, ops, OpenFlags::READ)
    }

    /// Builds a minimal ELF image with page-congruent segments.
    fn build_elf(e_type: u16, interp: Option<&[u8]>) -> Vec<u8> {
        let mut phs: Vec<(u32, u64, Vec<u8>, u64)> = Vec::new();
        if let Some(path) = interp {
            phs.push((3, 0, path.to_vec(), path.len() as u64)); // PT_INTERP
        }
        // One PT_LOAD at vaddr 0x1000 whose file offset is page-congruent.
        let code = vec![0x90u8; 64];
        phs.push((1, 0x1000, code, 0x2000)); // PT_LOAD, memsz > filesz

        let phoff = 64u64;
        let phnum = phs.len();
        let mut out = vec![0u8; 64 + phnum * 56];
        out[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        out[4] = 2;
        out[5] = 1;
        out[6] = 1;
        out[16..18].copy_from_slice(&e_type.to_le_bytes());
        out[18..20].copy_from_slice(&62u16.to_le_bytes());
        out[24..32].copy_from_slice(&0x1040u64.to_le_bytes()); // e_entry
        out[32..40].copy_from_slice(&phoff.to_le_bytes());
        out[52..54].copy_from_slice(&64u16.to_le_bytes());
        out[54..56].copy_from_slice(&56u16.to_le_bytes());
        out[56..58].copy_from_slice(&(phnum as u16).to_le_bytes());

        // Segment payloads: interp data right after headers; the load
        // segment payload at a page-congruent offset (0x1000 in file).
        let mut cursor = out.len();
        for (i, (p_type, vaddr, data, memsz)) in phs.iter().enumerate() {
            let ph = 64 + i * 56;
            let p_offset = if *p_type == 1 {
                // Page-congruent with vaddr 0x1000.
                if out.len() < 0x1000 {
                    out.resize(0x1000, 0);
                }
                0x1000
            } else {
                cursor
            };
            if out.len() < p_offset + data.len() {
                out.resize(p_offset + data.len(), 0);
            }
            out[p_offset..p_offset + data.len()].copy_from_slice(data);
            cursor = out.len();

            out[ph..ph + 4].copy_from_slice(&p_type.to_le_bytes());
            out[ph + 4..ph + 8].copy_from_slice(&5u32.to_le_bytes()); // R+X
            out[ph + 8..ph + 16].copy_from_slice(&(p_offset as u64).to_le_bytes());
            out[ph + 16..ph + 24].copy_from_slice(&vaddr.to_le_bytes());
            out[ph + 32..ph + 40].copy_from_slice(&(data.len() as u64).to_le_bytes());
            out[ph + 40..ph + 48].copy_from_slice(&memsz.to_le_bytes());
            out[ph + 48..ph + 56].copy_from_slice(&0x1000u64.to_le_bytes());
        }
        out
    }

    fn read_u64(space: &AddressSpace<HostMapper>, addr: u64) -> u64 {
        let page = addr & !(PAGE - 1);
        let phys = space.translate(page).unwrap();
        let inside = (addr - page) as usize;
        // SAFETY: Host identity map; the page was installed by the loader.
        unsafe { ((hhdm::phys_to_virt(phys) as *const u8).add(inside).cast::<u64>()).read_unaligned() }
    }

    /// Reads the auxv from the built stack: skip argc/argv/envp.
    fn find_auxv(space: &AddressSpace<HostMapper>, mut sp: u64) -> Vec<(u64, u64)> {
        let argc = read_u64(space, sp);
        sp += 8 * (1 + argc + 1); // argc + argv + NULL
        while read_u64(space, sp) != 0 {
            sp += 8; // envp entries
        }
        sp += 8; // envp NULL
        let mut auxv = Vec::new();
        loop {
            let tag = read_u64(space, sp);
            let value = read_u64(space, sp + 8);
            auxv.push((tag, value));
            if tag == AT_NULL {
                return auxv;
            }
            sp += 16;
        }
    }

    #[test]
    fn exec_image_maps_and_builds_stack() {
        crate::test_support::install_frames();
        let process = Process::new(None, Credentials { uid: 7, gid: 8 }).unwrap();
        let space: AddressSpace<HostMapper> = AddressSpace::new(HostMapper::new());
        let exe = mem_file(build_elf(2, None)); // ET_EXEC

        let image = load_with(&space, &process, exe, &["/bin/true", "-v"], &["TERM=dumb"], |_| {
            Err(Error::NoEnt)
        })
        .unwrap();

        assert_eq!(image.exe_base, 0);
        assert_eq!(image.entry, 0x1040);
        assert!(image.interp_base.is_none());
        assert_eq!(image.stack_pointer % 16, 0);

        // argc and argv[0] round-trip.
        assert_eq!(read_u64(&space, image.stack_pointer), 2);
        let auxv = find_auxv(&space, image.stack_pointer);
        let get = |tag| auxv.iter().find(|(t, _)| *t == tag).map(|(_, v)| *v);
        assert_eq!(get(AT_ENTRY), Some(0x1040));
        assert_eq!(get(AT_PAGESZ), Some(PAGE));
        assert_eq!(get(AT_UID), Some(7));
        assert_eq!(get(AT_SECURE), Some(0));
        assert!(get(AT_RANDOM).unwrap() > image.stack_pointer);

        // The heap starts past the image.
        assert_eq!(process.heap.lock().base, 0x3000);
    }

    #[test]
    fn dyn_with_interp_places_interpreter_away_from_base() {
        crate::test_support::install_frames();
        let process = Process::new(None, Credentials { uid: 0, gid: 0 }).unwrap();
        let space: AddressSpace<HostMapper> = AddressSpace::new(HostMapper::new());

        let exe = mem_file(build_elf(3, Some(b"/lib/ld.so\0"))); // ET_DYN
        let interp_image = build_elf(3, None);
        let image = load_with(
            &space,
            &process,
            exe,
            &["/bin/app"],
            &[],
            move |path| {
                assert_eq!(path, "/lib/ld.so");
                Ok(mem_file(interp_image))
            },
        )
        .unwrap();

        let interp_base = image.interp_base.expect("interpreter mapped");
        assert_ne!(interp_base, DEFAULT_VIRT_BASE);
        assert_eq!(image.entry, interp_base + 0x1040);

        let auxv = find_auxv(&space, image.stack_pointer);
        let get = |tag| auxv.iter().find(|(t, _)| *t == tag).map(|(_, v)| *v);
        assert_eq!(get(AT_BASE), Some(interp_base));
        assert_eq!(get(AT_ENTRY), Some(DEFAULT_VIRT_BASE + 0x1040));
    }

    #[test]
    fn rejects_non_elf_input() {
        crate::test_support::install_frames();
        let process = Process::new(None, Credentials { uid: 0, gid: 0 }).unwrap();
        let space: AddressSpace<HostMapper> = AddressSpace::new(HostMapper::new());
        let exe = mem_file(vec![0u8; 128]);
        let err = load_with(&space, &process, exe, &[], &[], |_| Err(Error::NoEnt)).unwrap_err();
        assert_eq!(err, Error::BadFormat);
    }
}
