//! Preemptive priority scheduler.
//!
//! One scheduler instance per CPU, each with dual active/expired priority
//! arrays. Tasks are pinned to the CPU that first enqueued them; only
//! initial placement balances load. Priorities combine a static delta
//! (creation policy) with a dynamic bonus derived from the task's
//! interactivity ratio, and the time slice is recomputed from the
//! effective priority on every requeue.
//!
//! The sleep/wake race is resolved by a four-state atomic state machine on
//! each task (see [`task::SleepState`]); the losing side of the race
//! always observes the other's transition, so a wakeup is never lost.
//!
//! Everything except the context switch itself is portable; the switch
//! goes through [`arch`], which host builds stub out so the scheduling
//! logic stays unit-testable.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod queue;
pub mod scheduler;
pub mod stack;
pub mod task;
pub mod waitq;

pub use scheduler::{
    CpuScheduler, adopt_boot_task, current_task, disable_preemption, enable_preemption,
    enqueue_task, exit_current, init_wait, maybe_resched_on_irq_exit, now_ticks, scheduler,
    scheduler_for, set_kernel_space_hook, set_tick_source, spawn_kernel, timer_event, wait,
    yield_now,
};
pub use task::{SleepState, Task, TaskKind};
pub use waitq::{WaitEntry, WaitQueue};
