//! Teletype devices.
//!
//! A TTY couples a line discipline, a lock-free input ring with atomic
//! reader/writer positions, a read wait queue, and an output flush
//! callback into the underlying driver. Opens are reference counted so
//! the console driver knows when the device goes idle.

pub mod ldisc;

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use boson_core::sync::SpinLock;
use boson_core::{Error, Result};
use boson_sched::waitq::WaitQueue;

use ldisc::{LdiscAction, LdiscMode, LineDiscipline};

/// Input ring capacity (one byte slack for full/empty detection).
const INPUT_RING: usize = 1024;

/// Single-producer single-consumer byte ring with atomic positions.
///
/// The IRQ-side writer and the task-side reader touch disjoint indices;
/// acquire/release on the positions orders the payload bytes.
struct AtomicRing {
    buf: UnsafeCell<[u8; INPUT_RING]>,
    read_pos: AtomicUsize,
    write_pos: AtomicUsize,
}

// SAFETY: SPSC discipline — the writer only advances write_pos over bytes
// it wrote, the reader only advances read_pos over bytes it consumed.
unsafe impl Send for AtomicRing {}
// SAFETY: As above.
unsafe impl Sync for AtomicRing {}

impl AtomicRing {
    const fn new() -> Self {
        Self {
            buf: UnsafeCell::new([0; INPUT_RING]),
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
        }
    }

    fn push(&self, byte: u8) -> bool {
        let write = self.write_pos.load(Ordering::Relaxed);
        let next = (write + 1) % INPUT_RING;
        if next == self.read_pos.load(Ordering::Acquire) {
            return false; // full
        }
        // SAFETY: Slot `write` is outside the readable region until the
        // release store below publishes it.
        unsafe { (*self.buf.get())[write] = byte };
        self.write_pos.store(next, Ordering::Release);
        true
    }

    fn pop(&self) -> Option<u8> {
        let read = self.read_pos.load(Ordering::Relaxed);
        if read == self.write_pos.load(Ordering::Acquire) {
            return None; // empty
        }
        // SAFETY: The acquire load above ordered the writer's byte store
        // before this read.
        let byte = unsafe { (*self.buf.get())[read] };
        self.read_pos.store((read + 1) % INPUT_RING, Ordering::Release);
        Some(byte)
    }

    fn is_empty(&self) -> bool {
        self.read_pos.load(Ordering::Acquire) == self.write_pos.load(Ordering::Acquire)
    }
}

/// Output sink into the terminal's driver.
pub type FlushFn = fn(&[u8]);

fn discard_output(_bytes: &[u8]) {}

/// One terminal device.
pub struct Tty {
    opens: AtomicU32,
    ldisc: SpinLock<LineDiscipline>,
    input: AtomicRing,
    /// Woken when readable bytes arrive.
    pub read_wait: WaitQueue,
    flush: FlushFn,
    /// Pending interrupt (Ctrl+C) not yet delivered to the foreground.
    pending_interrupt: AtomicU32,
    /// End-of-file seen (Ctrl+D on an empty line).
    eof: AtomicU32,
}

impl Tty {
    /// Creates a terminal flushing output through `flush`.
    #[must_use]
    pub const fn new(flush: FlushFn) -> Self {
        Self {
            opens: AtomicU32::new(0),
            ldisc: SpinLock::new(LineDiscipline::new()),
            input: AtomicRing::new(),
            read_wait: WaitQueue::new(),
            flush,
            pending_interrupt: AtomicU32::new(0),
            eof: AtomicU32::new(0),
        }
    }

    /// Creates a terminal that discards output (early boot, tests).
    #[must_use]
    pub const fn detached() -> Self {
        Self::new(discard_output)
    }

    /// Opens the device; returns the new open count.
    pub fn open(&self) -> u32 {
        self.opens.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Closes the device; returns the remaining open count.
    ///
    /// # Panics
    ///
    /// Panics on close without a matching open.
    pub fn close(&self) -> u32 {
        let prev = self.opens.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "tty close without open");
        prev - 1
    }

    /// Current open count.
    #[must_use]
    pub fn open_count(&self) -> u32 {
        self.opens.load(Ordering::Acquire)
    }

    /// Switches the line discipline mode.
    pub fn set_mode(&self, mode: LdiscMode) {
        self.ldisc.lock().set_mode(mode);
    }

    /// Driver input path: feeds received bytes through the discipline.
    ///
    /// Echo and committed lines go out / become readable here. Safe from
    /// IRQ context (the wait queue wake is CAS-based).
    pub fn push_input(&self, bytes: &[u8]) {
        for &byte in bytes {
            let action = self.ldisc.lock().process_byte(byte);
            match action {
                LdiscAction::None => {}
                LdiscAction::Echo(c) => (self.flush)(&[c]),
                LdiscAction::EraseOne => (self.flush)(b"\x08 \x08"),
                LdiscAction::LineReady(_) => {
                    let mut ldisc = self.ldisc.lock();
                    for &b in ldisc.line() {
                        if !self.input.push(b) {
                            break;
                        }
                    }
                    ldisc.consume_line();
                    drop(ldisc);
                    (self.flush)(b"\n");
                    self.read_wait.wake_all();
                }
                LdiscAction::Interrupt => {
                    self.pending_interrupt.store(1, Ordering::Release);
                    (self.flush)(b"^C\n");
                    self.read_wait.wake_all();
                }
                LdiscAction::Eof => {
                    self.eof.store(1, Ordering::Release);
                    self.read_wait.wake_all();
                }
                LdiscAction::RawByte(c) => {
                    let _ = self.input.push(c);
                    self.read_wait.wake_all();
                }
            }
        }
    }

    /// Non-blocking read of buffered input.
    ///
    /// # Errors
    ///
    /// `Busy` when nothing is readable yet (callers block on
    /// [`Tty::read_wait`] and retry); 0 bytes at EOF.
    pub fn try_read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut n = 0;
        while n < buf.len() {
            match self.input.pop() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        if n > 0 {
            return Ok(n);
        }
        if self.eof.swap(0, Ordering::AcqRel) != 0 {
            return Ok(0);
        }
        Err(Error::Busy)
    }

    /// Takes the pending interrupt flag (Ctrl+C seen).
    #[must_use]
    pub fn take_interrupt(&self) -> bool {
        self.pending_interrupt.swap(0, Ordering::AcqRel) != 0
    }

    /// Whether buffered input is available.
    #[must_use]
    pub fn has_input(&self) -> bool {
        !self.input.is_empty()
    }

    /// Writes bytes to the terminal's output.
    pub fn write(&self, bytes: &[u8]) {
        (self.flush)(bytes);
    }
}
