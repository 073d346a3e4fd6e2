//! Clock class.
//!
//! A clock keeps wall time and can drive a periodic interrupt. Several
//! may register (RTC, HPET-backed, …); the kernel promotes the
//! highest-kind one to *system clock* and reads the date through it.

use alloc::sync::Arc;
use alloc::vec::Vec;

use boson_core::sync::SpinLock;
use boson_core::{Error, Result, kinfo};

/// Quality tier of a clock source; higher is preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClockKind {
    /// Always-present fallback (e.g. PIT-derived).
    Embedded,
    /// Battery-backed RTC.
    SystemLow,
    /// High-resolution platform clock.
    SystemHigh,
}

/// Broken-down wall time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateTime {
    /// Full year (e.g. 2024).
    pub year: u16,
    /// Month 1-12.
    pub month: u8,
    /// Day 1-31.
    pub day: u8,
    /// Hour 0-23.
    pub hour: u8,
    /// Minute 0-59.
    pub minute: u8,
    /// Second 0-59.
    pub second: u8,
}

/// The clock device contract.
pub trait Clock: Send + Sync {
    /// Source quality tier.
    fn kind(&self) -> ClockKind;

    /// Reads wall time.
    ///
    /// # Errors
    ///
    /// `IoFailed` when the hardware read fails.
    fn get_date_time(&self) -> Result<DateTime>;

    /// Writes wall time.
    ///
    /// # Errors
    ///
    /// `BadOperation` for read-only clocks.
    fn set_date_time(&self, _dt: DateTime) -> Result<()> {
        Err(Error::BadOperation)
    }

    /// Masks the clock's interrupt line.
    fn mask_irq(&self) {}

    /// Programs the periodic interrupt: divider plus tick callback.
    ///
    /// # Errors
    ///
    /// `BadOperation` when the clock cannot interrupt.
    fn config_irq(&self, _freq_div: u32, _callback: fn()) -> Result<()> {
        Err(Error::BadOperation)
    }
}

struct Registry {
    clocks: Vec<Arc<dyn Clock>>,
    system: Option<Arc<dyn Clock>>,
}

static REGISTRY: SpinLock<Registry> = SpinLock::new(Registry {
    clocks: Vec::new(),
    system: None,
});

/// Registers a clock; promotes it when it beats the current system
/// clock's kind.
pub fn register(clock: Arc<dyn Clock>) {
    let mut registry = REGISTRY.lock();
    let promote = registry
        .system
        .as_ref()
        .is_none_or(|cur| clock.kind() > cur.kind());
    if promote {
        kinfo!("clock: system clock is now {:?}", clock.kind());
        registry.system = Some(clock.clone());
    }
    registry.clocks.push(clock);
}

/// The promoted system clock.
#[must_use]
pub fn system_clock() -> Option<Arc<dyn Clock>> {
    REGISTRY.lock().system.clone()
}

/// Reads wall time from the system clock.
///
/// # Errors
///
/// `NoEnt` before any clock registers.
pub fn date_time() -> Result<DateTime> {
    system_clock().ok_or(Error::NoEnt)?.get_date_time()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClock {
        kind: ClockKind,
        at: DateTime,
    }

    impl Clock for FixedClock {
        fn kind(&self) -> ClockKind {
            self.kind
        }
        fn get_date_time(&self) -> Result<DateTime> {
            Ok(self.at)
        }
    }

    fn at(hour: u8) -> DateTime {
        DateTime {
            year: 2024,
            month: 6,
            day: 1,
            hour,
            minute: 0,
            second: 0,
        }
    }

    #[test]
    fn highest_kind_wins_promotion() {
        register(Arc::new(FixedClock {
            kind: ClockKind::Embedded,
            at: at(1),
        }));
        register(Arc::new(FixedClock {
            kind: ClockKind::SystemHigh,
            at: at(2),
        }));
        // A lower-kind late arrival must not demote the system clock.
        register(Arc::new(FixedClock {
            kind: ClockKind::SystemLow,
            at: at(3),
        }));
        assert_eq!(system_clock().unwrap().kind(), ClockKind::SystemHigh);
        assert_eq!(date_time().unwrap().hour, 2);
    }

    #[test]
    fn kinds_order_as_expected() {
        assert!(ClockKind::Embedded < ClockKind::SystemLow);
        assert!(ClockKind::SystemLow < ClockKind::SystemHigh);
    }
}
