//! Boot-relative time.
//!
//! The system timer's periodic interrupt calls [`timer_tick`], which
//! advances the global tick counter and charges the elapsed ticks to the
//! running task. One tick is `1 / TICK_HZ` seconds.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::TICK_HZ;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Ticks since boot.
#[must_use]
pub fn uptime_ticks() -> u64 {
    TICKS.load(Ordering::Acquire)
}

/// Milliseconds since boot.
#[must_use]
pub fn uptime_ms() -> u64 {
    uptime_ticks() * 1000 / TICK_HZ
}

/// Registers the scheduler's tick source. Boot only.
pub fn init() {
    boson_sched::set_tick_source(uptime_ticks);
}

/// Timer interrupt body: advance time, charge the scheduler.
///
/// IRQ context; must not allocate.
pub fn timer_tick(elapsed: u64) {
    TICKS.fetch_add(elapsed, Ordering::AcqRel);
    boson_sched::timer_event(elapsed);
}
