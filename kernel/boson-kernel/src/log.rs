//! Kernel logging backends.
//!
//! Two phases, switched during boot:
//!
//! 1. **Early serial** — before the heap exists, raw print/log functions
//!    write straight to COM1 with no locks and no allocation.
//! 2. **Full logger** — once allocation works, a [`Logger`] fans log
//!    lines out to registered [`LogSink`]s with level filtering and a
//!    milliseconds-since-boot timestamp.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt::{self, Write as _};

use boson_core::log::LogLevel;
use boson_core::sync::SpinLock;

use crate::drivers::uart16550::{COM1, Uart16550};

/// An output sink for the full logger.
pub trait LogSink: Send + Sync {
    /// Writes one string fragment.
    fn write_str(&self, s: &str);
    /// Most verbose level this sink accepts.
    fn max_level(&self) -> LogLevel;
    /// Name for diagnostics.
    fn name(&self) -> &str;
}

/// A [`LogSink`] writing to a 16550 UART.
pub struct SerialSink {
    uart: Uart16550,
    max_level: LogLevel,
}

impl SerialSink {
    /// Creates a serial sink.
    #[must_use]
    pub fn new(uart: Uart16550, max_level: LogLevel) -> Self {
        Self { uart, max_level }
    }
}

impl LogSink for SerialSink {
    fn write_str(&self, s: &str) {
        self.uart.write_str(s);
    }

    fn max_level(&self) -> LogLevel {
        self.max_level
    }

    fn name(&self) -> &str {
        "serial"
    }
}

static SINKS: SpinLock<Vec<Box<dyn LogSink>>> = SpinLock::new(Vec::new());

/// Adds a sink to the full logger.
pub fn add_sink(sink: Box<dyn LogSink>) {
    SINKS.lock().push(sink);
}

// ---------------------------------------------------------------------------
// Phase 1: early serial
// ---------------------------------------------------------------------------

struct EarlyWriter;

impl fmt::Write for EarlyWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        Uart16550::new(COM1).write_str(s);
        Ok(())
    }
}

fn early_print(args: fmt::Arguments<'_>) {
    let _ = EarlyWriter.write_fmt(args);
}

fn early_log(level: LogLevel, args: fmt::Arguments<'_>) {
    let _ = EarlyWriter.write_fmt(format_args!("[{}] {}\n", level.name(), args));
}

/// Brings up COM1 and routes the log macros to it. First thing in boot.
pub fn init_early_serial() {
    Uart16550::new(COM1).init();
    boson_core::log::set_print_fn(early_print);
    boson_core::log::set_log_fn(early_log);
}

// ---------------------------------------------------------------------------
// Phase 2: full logger
// ---------------------------------------------------------------------------

struct SinkWriter<'a> {
    sink: &'a dyn LogSink,
}

impl fmt::Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.sink.write_str(s);
        Ok(())
    }
}

fn full_print(args: fmt::Arguments<'_>) {
    let sinks = SINKS.lock();
    for sink in sinks.iter() {
        let _ = (SinkWriter { sink: sink.as_ref() }).write_fmt(args);
    }
}

fn full_log(level: LogLevel, args: fmt::Arguments<'_>) {
    let ms = crate::time::uptime_ms();
    let sinks = SINKS.lock();
    for sink in sinks.iter() {
        if level > sink.max_level() {
            continue;
        }
        let _ = (SinkWriter { sink: sink.as_ref() }).write_fmt(format_args!(
            "[{:6}.{:03}] {} {}\n",
            ms / 1000,
            ms % 1000,
            level.name(),
            args
        ));
    }
}

/// Switches from early serial to the sink-based logger.
///
/// Requires a working heap; the serial sink is installed by default.
pub fn init_logger(max_level: LogLevel) {
    add_sink(Box::new(SerialSink::new(Uart16550::new(COM1), max_level)));
    boson_core::log::set_print_fn(full_print);
    boson_core::log::set_log_fn(full_log);
    boson_core::log::set_max_level(max_level);
}
