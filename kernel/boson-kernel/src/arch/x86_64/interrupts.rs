//! Hardware interrupt dispatch.
//!
//! Vectors 32-255 funnel through macro-generated stubs into
//! [`dispatch_interrupt`], which brackets the handler with the per-CPU
//! nesting counter, drains deferred input delivery, and gives the
//! scheduler its safe preemption point on the way out.
//!
//! Device drivers reserve `(cpu, vector)` pairs dynamically from a
//! per-CPU bitmap starting at vector 32 and install handlers per CPU.

use core::sync::atomic::{AtomicPtr, Ordering};

use boson_core::id::CpuId;
use boson_core::percpu::{CpuLocal, MAX_CPUS};
use boson_core::sync::IrqSpinLock;
use boson_core::{Error, Result, kerror};

/// Number of dispatchable hardware vectors (32-255).
const NUM_VECTORS: usize = 224;

/// Exception/interrupt stack frame pushed by the CPU.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct InterruptStackFrame {
    /// Saved instruction pointer.
    pub rip: u64,
    /// Saved code segment.
    pub cs: u64,
    /// Saved flags.
    pub rflags: u64,
    /// Saved stack pointer.
    pub rsp: u64,
    /// Saved stack segment.
    pub ss: u64,
}

/// Handler signature: receives the vector number.
pub type InterruptHandler = fn(u8);

/// Per-CPU handler tables, one atomic slot per vector.
static HANDLERS: CpuLocal<[AtomicPtr<()>; NUM_VECTORS]> = CpuLocal::new(
    [const { [const { AtomicPtr::new(core::ptr::null_mut()) }; NUM_VECTORS] }; MAX_CPUS],
);

/// Per-CPU reservation bitmaps covering vectors 32-255.
static RESERVED: CpuLocal<IrqSpinLock<[u64; 4]>> =
    CpuLocal::new([const { IrqSpinLock::new([0; 4]) }; MAX_CPUS]);

/// A reserved interrupt source location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntrLocation {
    /// The CPU whose table holds the vector.
    pub cpu: CpuId,
    /// The vector number (32-255).
    pub vector: u8,
}

/// Reserves the first free vector on `cpu`, scanning from 32.
///
/// # Errors
///
/// `MaxSize` when every vector on that CPU is taken.
pub fn reserve(cpu: CpuId) -> Result<IntrLocation> {
    let mut bitmap = RESERVED.get_for(cpu).lock();
    for (word_idx, word) in bitmap.iter_mut().enumerate() {
        if *word == u64::MAX {
            continue;
        }
        let bit = word.trailing_ones();
        *word |= 1 << bit;
        let vector = 32 + word_idx as u8 * 64 + bit as u8;
        return Ok(IntrLocation { cpu, vector });
    }
    Err(Error::MaxSize)
}

/// Releases a reserved vector and removes its handler.
pub fn release(location: IntrLocation) {
    let idx = (location.vector - 32) as usize;
    HANDLERS.get_for(location.cpu)[idx].store(core::ptr::null_mut(), Ordering::Release);
    let mut bitmap = RESERVED.get_for(location.cpu).lock();
    bitmap[idx / 64] &= !(1 << (idx % 64));
}

/// Installs the handler for a reserved location.
///
/// # Errors
///
/// `Exists` when a handler already occupies the slot.
pub fn setup_handler(location: IntrLocation, handler: InterruptHandler) -> Result<()> {
    let idx = (location.vector - 32) as usize;
    HANDLERS.get_for(location.cpu)[idx]
        .compare_exchange(
            core::ptr::null_mut(),
            handler as *mut (),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .map(|_| ())
        .map_err(|_| Error::Exists)
}

/// Common dispatch body behind every hardware interrupt stub.
fn dispatch_interrupt(vector: u8) {
    let sched = boson_sched::scheduler();
    let depth = sched.irq_enter();

    let idx = (vector - 32) as usize;
    let handler = HANDLERS.get()[idx].load(Ordering::Acquire);
    if !handler.is_null() {
        // SAFETY: The slot only ever holds a valid `InterruptHandler`
        // installed through setup_handler.
        let f: InterruptHandler = unsafe { core::mem::transmute(handler) };
        f(vector);
    }

    // Bottom halves: outermost exit only.
    if depth == 1 {
        crate::drivers::input::run_deferred();
    }

    let depth = sched.irq_exit();
    boson_sched::maybe_resched_on_irq_exit(depth + 1);
}

/// Stub signature installed into the IDT.
pub type StubFn = extern "x86-interrupt" fn(InterruptStackFrame);

macro_rules! stub_table {
    ($($offset:literal)*) => {
        [$({
            extern "x86-interrupt" fn stub(_frame: InterruptStackFrame) {
                dispatch_interrupt($offset + 32);
            }
            stub as StubFn
        }),*]
    };
}

/// All 224 hardware interrupt stubs; `STUBS[i]` serves vector `i + 32`.
pub static STUBS: [StubFn; NUM_VECTORS] = stub_table!(
    0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15
    16 17 18 19 20 21 22 23 24 25 26 27 28 29 30 31
    32 33 34 35 36 37 38 39 40 41 42 43 44 45 46 47
    48 49 50 51 52 53 54 55 56 57 58 59 60 61 62 63
    64 65 66 67 68 69 70 71 72 73 74 75 76 77 78 79
    80 81 82 83 84 85 86 87 88 89 90 91 92 93 94 95
    96 97 98 99 100 101 102 103 104 105 106 107 108 109 110 111
    112 113 114 115 116 117 118 119 120 121 122 123 124 125 126 127
    128 129 130 131 132 133 134 135 136 137 138 139 140 141 142 143
    144 145 146 147 148 149 150 151 152 153 154 155 156 157 158 159
    160 161 162 163 164 165 166 167 168 169 170 171 172 173 174 175
    176 177 178 179 180 181 182 183 184 185 186 187 188 189 190 191
    192 193 194 195 196 197 198 199 200 201 202 203 204 205 206 207
    208 209 210 211 212 213 214 215 216 217 218 219 220 221 222 223
);

// ---------------------------------------------------------------------------
// Exception handlers
// ---------------------------------------------------------------------------

fn dump_frame(name: &str, frame: &InterruptStackFrame) {
    let rip = frame.rip;
    let rsp = frame.rsp;
    let rflags = frame.rflags;
    kerror!("{name}: rip={rip:#x} rsp={rsp:#x} rflags={rflags:#x}");
}

/// #DE
pub extern "x86-interrupt" fn divide_error(frame: InterruptStackFrame) {
    dump_frame("divide error", &frame);
    panic!("unhandled #DE");
}

/// #BP
pub extern "x86-interrupt" fn breakpoint(frame: InterruptStackFrame) {
    dump_frame("breakpoint", &frame);
}

/// #UD
pub extern "x86-interrupt" fn invalid_opcode(frame: InterruptStackFrame) {
    dump_frame("invalid opcode", &frame);
    panic!("unhandled #UD");
}

/// #DF
pub extern "x86-interrupt" fn double_fault(frame: InterruptStackFrame, _err: u64) -> ! {
    dump_frame("double fault", &frame);
    panic!("double fault");
}

/// #GP
pub extern "x86-interrupt" fn general_protection(frame: InterruptStackFrame, err: u64) {
    dump_frame("general protection", &frame);
    kerror!("#GP error code {err:#x}");
    panic!("unhandled #GP");
}

/// #PF — tries demand population through the faulting task's address
/// space before giving up.
pub extern "x86-interrupt" fn page_fault(frame: InterruptStackFrame, err: u64) {
    let addr = super::instructions::read_cr2();
    let write = err & 0x2 != 0;

    let handled = boson_sched::current_task()
        .and_then(|task| task.user_payload().cloned())
        .and_then(|payload| payload.downcast::<crate::proc::Process>().ok())
        .map(|process| process.space().handle_fault(addr, write).is_ok())
        .unwrap_or(false);
    if handled {
        return;
    }

    dump_frame("page fault", &frame);
    kerror!("#PF at {addr:#x} (error {err:#x})");
    panic!("unhandled page fault");
}
