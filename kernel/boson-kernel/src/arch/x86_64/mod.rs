//! x86-64 support: segment bases, IDT, interrupt dispatch, page tables,
//! and the syscall/userspace transition machinery.

pub mod gdt;
pub mod idt;
pub mod instructions;
pub mod interrupts;
pub mod paging;
pub mod percpu;
pub mod syscall;
pub mod userspace;

/// Per-CPU bring-up: GS base, GDT/TSS, IDT, and the syscall MSRs.
///
/// Called once on the boot CPU before interrupts are enabled, and again
/// on each application processor.
pub fn cpu_init() {
    // SAFETY: Boot sequencing — nothing can take an interrupt or issue a
    // syscall before this returns.
    unsafe {
        percpu::init_gs_base();
        let cpu = boson_core::percpu::current_cpu().as_usize();
        gdt::init(cpu);
        idt::init();
        syscall::init();
    }
}
