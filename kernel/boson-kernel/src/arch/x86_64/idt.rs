//! Interrupt descriptor table.
//!
//! The gate/table structures plus the boot-time wiring of exception
//! handlers and the hardware interrupt stubs. Every CPU loads its own
//! copy of the table so per-CPU vector reservation stays honest.

use core::mem::size_of;

use boson_core::kdebug;
use boson_core::percpu::MAX_CPUS;
use boson_core::sync::LazyLock;

use super::interrupts::{self, InterruptStackFrame};

/// One 16-byte IDT gate.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct IdtEntry {
    offset_low: u16,
    selector: u16,
    options: u16,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

/// Kernel code segment selector.
const KERNEL_CS: u16 = 0x08;

/// Gate options: present, interrupt gate (IF cleared on entry).
const GATE_INTERRUPT: u16 = 0x8E00;

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            options: 0,
            offset_mid: 0,
            offset_high: 0,
            reserved: 0,
        }
    }

    fn set_handler_addr(&mut self, addr: u64) {
        self.offset_low = addr as u16;
        self.offset_mid = (addr >> 16) as u16;
        self.offset_high = (addr >> 32) as u32;
        self.selector = KERNEL_CS;
        self.options = GATE_INTERRUPT;
    }

    /// Installs a plain exception handler.
    pub fn set_handler(&mut self, handler: extern "x86-interrupt" fn(InterruptStackFrame)) {
        self.set_handler_addr(handler as usize as u64);
    }

    /// Installs an exception handler that receives an error code.
    pub fn set_handler_with_err(
        &mut self,
        handler: extern "x86-interrupt" fn(InterruptStackFrame, u64),
    ) {
        self.set_handler_addr(handler as usize as u64);
    }

    /// Installs a diverging handler with an error code (double fault).
    pub fn set_diverging_with_err(
        &mut self,
        handler: extern "x86-interrupt" fn(InterruptStackFrame, u64) -> !,
    ) {
        self.set_handler_addr(handler as usize as u64);
    }
}

/// The 256-gate table.
#[repr(C, align(16))]
pub struct InterruptDescriptorTable {
    entries: [IdtEntry; 256],
}

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u64,
}

impl InterruptDescriptorTable {
    fn new() -> Self {
        let mut idt = Self {
            entries: [IdtEntry::missing(); 256],
        };

        // CPU exceptions (vectors 0-31).
        idt.entries[0].set_handler(interrupts::divide_error);
        idt.entries[3].set_handler(interrupts::breakpoint);
        idt.entries[6].set_handler(interrupts::invalid_opcode);
        idt.entries[8].set_diverging_with_err(interrupts::double_fault);
        idt.entries[13].set_handler_with_err(interrupts::general_protection);
        idt.entries[14].set_handler_with_err(interrupts::page_fault);

        // Hardware interrupt stubs (vectors 32-255) into the dispatcher.
        for (i, stub) in interrupts::STUBS.iter().enumerate() {
            idt.entries[32 + i].set_handler_addr(*stub as usize as u64);
        }
        idt
    }

    /// Loads this table into the executing CPU.
    ///
    /// # Safety
    ///
    /// The table must stay alive for as long as it is loaded.
    pub unsafe fn load(&'static self) {
        let pointer = IdtPointer {
            limit: (size_of::<Self>() - 1) as u16,
            base: self as *const Self as u64,
        };
        // SAFETY: The pointer describes a live static table.
        unsafe {
            core::arch::asm!("lidt [{}]", in(reg) &pointer, options(readonly, nostack));
        }
    }
}

/// One IDT per CPU.
static IDTS: [LazyLock<InterruptDescriptorTable>; MAX_CPUS] =
    [const { LazyLock::new(InterruptDescriptorTable::new as fn() -> InterruptDescriptorTable) };
        MAX_CPUS];

/// Builds (on first use) and loads the executing CPU's IDT.
///
/// # Safety
///
/// GDT and GS base must be programmed first.
pub unsafe fn init() {
    let cpu = boson_core::percpu::current_cpu();
    let idt: &'static InterruptDescriptorTable = &IDTS[cpu.as_usize()];
    // SAFETY: The table lives in a static.
    unsafe { idt.load() };
    kdebug!("{cpu}: IDT loaded");
}
