//! Timer class.
//!
//! Free-running or periodic counters (PIT, HPET comparators, LAPIC
//! timer). Capabilities vary per device, so everything beyond reading
//! the counter is optional and declared through `supported_modes`.

use alloc::sync::Arc;
use alloc::vec::Vec;

use boson_core::sync::SpinLock;
use boson_core::{Error, Result};

/// Operating modes a timer may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    /// Counts without interrupting.
    FreeRunning,
    /// Fires at a programmed frequency.
    Periodic,
    /// Fires once after a programmed interval.
    OneShot,
}

/// Accepted deviation when programming a frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accuracy {
    /// The device must hit the frequency exactly.
    Exact,
    /// The nearest achievable frequency is fine.
    Nearest,
}

/// The timer device contract.
pub trait Timer: Send + Sync {
    /// Current counter value, in device ticks.
    fn get_counter(&self) -> u64;

    /// Modes this device supports.
    fn supported_modes(&self) -> &'static [TimerMode];

    /// Presets the counter (devices that allow it).
    ///
    /// # Errors
    ///
    /// `BadOperation` when the counter is read-only.
    fn set_init_counter(&self, _value: u64) -> Result<()> {
        Err(Error::BadOperation)
    }

    /// Programs the tick frequency.
    ///
    /// # Errors
    ///
    /// `BadOperation` for fixed-frequency devices, `InvalidArgs` when
    /// `Exact` is requested but unreachable.
    fn set_frequency(&self, _hz: u64, _accuracy: Accuracy) -> Result<()> {
        Err(Error::BadOperation)
    }

    /// Switches the operating mode.
    ///
    /// # Errors
    ///
    /// `BadOperation` when the mode is not in `supported_modes`.
    fn set_mode(&self, _mode: TimerMode) -> Result<()> {
        Err(Error::BadOperation)
    }
}

static TIMERS: SpinLock<Vec<Arc<dyn Timer>>> = SpinLock::new(Vec::new());

/// Registers a timer device.
pub fn register(timer: Arc<dyn Timer>) {
    TIMERS.lock().push(timer);
}

/// Finds a registered timer supporting `mode`.
#[must_use]
pub fn find_with_mode(mode: TimerMode) -> Option<Arc<dyn Timer>> {
    TIMERS
        .lock()
        .iter()
        .find(|t| t.supported_modes().contains(&mode))
        .cloned()
}
