//! GDT and TSS.
//!
//! Fixed layout the syscall MSRs depend on: kernel code 0x08, kernel
//! data 0x10, user data 0x18, user code 0x20, TSS 0x28. The TSS carries
//! RSP0 so interrupts from ring 3 land on the per-CPU kernel stack.

use core::cell::UnsafeCell;
use core::mem::size_of;

use boson_core::percpu::MAX_CPUS;

/// Kernel code selector.
pub const KERNEL_CS: u16 = 0x08;
/// Kernel data selector.
pub const KERNEL_DS: u16 = 0x10;
/// User data selector (RPL 3 applied at transition).
pub const USER_DS: u16 = 0x18;
/// User code selector.
pub const USER_CS: u16 = 0x20;
/// TSS selector.
pub const TSS_SEL: u16 = 0x28;

/// 64-bit task state segment (hardware layout; fields are unaligned).
#[repr(C, packed)]
struct TssLayout {
    _reserved0: u32,
    /// Stack for ring-0 entry from ring 3.
    rsp0: u64,
    rsp1: u64,
    rsp2: u64,
    _reserved1: u64,
    ist: [u64; 7],
    _reserved2: u64,
    _reserved3: u16,
    iopb_offset: u16,
}

/// One CPU's TSS; mutation goes through raw unaligned writes because
/// the hardware layout misaligns every 64-bit field.
struct Tss(UnsafeCell<TssLayout>);

// SAFETY: Each CPU only writes its own TSS, from task context, with the
// hardware reading it asynchronously — single-writer discipline.
unsafe impl Sync for Tss {}

impl Tss {
    const fn new() -> Self {
        Self(UnsafeCell::new(TssLayout {
            _reserved0: 0,
            rsp0: 0,
            rsp1: 0,
            rsp2: 0,
            _reserved1: 0,
            ist: [0; 7],
            _reserved2: 0,
            _reserved3: 0,
            iopb_offset: size_of::<TssLayout>() as u16,
        }))
    }
}

/// One GDT: 5 descriptors plus the 16-byte TSS descriptor.
#[repr(C, align(8))]
struct Gdt {
    entries: [u64; 7],
}

// Segment descriptor bit patterns (long mode ignores base/limit for
// code/data; only type, DPL, P, and L matter).
const KERNEL_CODE_DESC: u64 = 0x00AF_9B00_0000_FFFF;
const KERNEL_DATA_DESC: u64 = 0x00CF_9300_0000_FFFF;
const USER_DATA_DESC: u64 = 0x00CF_F300_0000_FFFF;
const USER_CODE_DESC: u64 = 0x00AF_FB00_0000_FFFF;

static TSS: [Tss; MAX_CPUS] = [const { Tss::new() }; MAX_CPUS];

struct PerCpuGdt {
    gdt: Gdt,
}

// SAFETY: Each CPU only loads and mutates its own table during bring-up.
unsafe impl Sync for PerCpuGdt {}

static GDTS: [PerCpuGdt; MAX_CPUS] = [const {
    PerCpuGdt {
        gdt: Gdt {
            entries: [
                0,
                KERNEL_CODE_DESC,
                KERNEL_DATA_DESC,
                USER_DATA_DESC,
                USER_CODE_DESC,
                0, // TSS low, patched at init
                0, // TSS high, patched at init
            ],
        },
    }
}; MAX_CPUS];

#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u64,
}

fn tss_descriptor(tss: &'static Tss) -> (u64, u64) {
    let base = tss.0.get() as u64;
    let limit = (size_of::<TssLayout>() - 1) as u64;
    let low = (limit & 0xFFFF)
        | ((base & 0xFF_FFFF) << 16)
        | (0x89 << 40) // present, available 64-bit TSS
        | (((limit >> 16) & 0xF) << 48)
        | (((base >> 24) & 0xFF) << 56);
    (low, base >> 32)
}

/// Loads this CPU's GDT and TSS.
///
/// # Safety
///
/// Must run once per CPU during bring-up, before the first ring
/// transition.
pub unsafe fn init(cpu: usize) {
    let tss = &TSS[cpu];
    let (low, high) = tss_descriptor(tss);
    let gdt = &GDTS[cpu].gdt;
    // SAFETY: Only this CPU touches its table, and only before load.
    unsafe {
        let entries = gdt.entries.as_ptr().cast_mut();
        entries.add(5).write(low);
        entries.add(6).write(high);
    }

    let pointer = GdtPointer {
        limit: (size_of::<Gdt>() - 1) as u16,
        base: gdt as *const Gdt as u64,
    };
    // SAFETY: The pointer describes a live static table; the selector
    // reloads match the fixed layout above.
    unsafe {
        core::arch::asm!(
            "lgdt [{ptr}]",
            // Reload CS via far return, then the data segments.
            "push {kcs}",
            "lea {tmp}, [2f + rip]",
            "push {tmp}",
            "retfq",
            "2:",
            "mov ds, {kds:x}",
            "mov es, {kds:x}",
            "mov ss, {kds:x}",
            "ltr {tss:x}",
            ptr = in(reg) &pointer,
            kcs = in(reg) u64::from(KERNEL_CS),
            kds = in(reg) u32::from(KERNEL_DS),
            tss = in(reg) u32::from(TSS_SEL),
            tmp = out(reg) _,
        );
    }
}

/// Points this CPU's TSS RSP0 at a kernel stack top for ring-3 entry.
pub fn set_interrupt_stack(cpu: usize, rsp0: u64) {
    // SAFETY: Single-writer per CPU (see Tss); unaligned write because
    // the hardware layout puts rsp0 at offset 4.
    unsafe {
        core::ptr::addr_of_mut!((*TSS[cpu].0.get()).rsp0).write_unaligned(rsp0);
    }
}
