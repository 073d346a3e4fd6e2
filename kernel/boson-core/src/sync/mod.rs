//! Synchronization primitives.
//!
//! Two spin-lock flavours exist, per the rule that any lock shared with
//! IRQ context must disable interrupts in *all* lock sites:
//!
//! - [`SpinLock`] — plain TTAS lock, task-context only.
//! - [`IrqSpinLock`] — saves RFLAGS, disables interrupts, then locks.
//!
//! [`LazyLock`] supplies once-initialized statics.

mod irq;
mod lazy;
mod spinlock;

pub use irq::{irq_restore, irq_save_disable};
pub use lazy::LazyLock;
pub use spinlock::{IrqSpinLock, IrqSpinLockGuard, SpinLock, SpinLockGuard};
