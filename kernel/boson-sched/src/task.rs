//! Task objects and scheduling arithmetic.
//!
//! A task is the unit of scheduling: a kernel stack, a saved context, the
//! scheduling stats, and either a kernel payload (just a name) or a user
//! payload (the owning process, opaque to this crate). Sleep/wake state is
//! a four-state machine in one atomic byte; all transitions go through
//! CAS so the decide-to-sleep vs. external-wake race resolves
//! deterministically.

use alloc::sync::Arc;
use core::any::Any;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use boson_core::Result;
use boson_core::id::CpuId;
use boson_core::list::{Linked, Node};
use boson_core::sync::IrqSpinLock;

use crate::arch::{self, Context};
use crate::stack::KernelStack;

/// Number of priority levels; 0 is best, `MAX_PRIORITIES - 1` worst.
pub const MAX_PRIORITIES: usize = 32;

/// Default priority: the middle of the range.
pub const BASE_PRIORITY: u8 = (MAX_PRIORITIES / 2) as u8;

/// Largest magnitude of the interactivity bonus delta.
pub const MAX_BONUS: i8 = 8;

/// Shortest time slice, in scheduler ticks.
pub const MIN_TIME_SLICE: u32 = 2;

/// Longest time slice, in scheduler ticks.
pub const MAX_TIME_SLICE: u32 = 20;

/// Fixed-point shift for the interactivity ratio.
const RATIO_SHIFT: u32 = 10;

/// Sleep/wake state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SleepState {
    /// Runnable (on a queue or running).
    Awake = 0,
    /// Decided to sleep; not yet switched out.
    FallingAsleep = 1,
    /// A wakeup arrived while falling asleep; must not sleep.
    NeedsWakeup = 2,
    /// Switched out, waiting for a wakeup.
    Sleeping = 3,
}

impl SleepState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Awake,
            1 => Self::FallingAsleep,
            2 => Self::NeedsWakeup,
            _ => Self::Sleeping,
        }
    }
}

/// Outcome of [`Task::try_wakeup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeAction {
    /// The task was already awake; nothing to do.
    AlreadyAwake,
    /// The task was falling asleep; it will observe the wakeup when it
    /// finishes switching out and requeue itself.
    Deferred,
    /// The task was asleep and is now awake; the caller must enqueue it.
    Runnable,
}

/// Scheduling statistics, guarded by the per-task stats lock.
#[derive(Debug, Clone, Copy)]
pub struct SchedStats {
    /// Remaining ticks in the current time slice.
    pub time_slice: u32,
    /// Ticks spent on a CPU.
    pub cpu_time: u64,
    /// Ticks spent blocked or voluntarily yielding.
    pub sleep_time: u64,
    /// Fixed delta from creation policy.
    pub static_delta: i8,
    /// Dynamic delta from the interactivity ratio.
    pub bonus_delta: i8,
}

impl SchedStats {
    /// Fresh stats for a new task.
    #[must_use]
    pub fn new(static_delta: i8) -> Self {
        let mut stats = Self {
            time_slice: 0,
            cpu_time: 0,
            sleep_time: 0,
            static_delta,
            bonus_delta: 0,
        };
        stats.time_slice = time_slice_for(stats.effective_priority());
        stats
    }

    /// Effective priority: base + static + bonus, clamped to the range.
    #[must_use]
    pub fn effective_priority(&self) -> u8 {
        let p = BASE_PRIORITY as i32 + self.static_delta as i32 + self.bonus_delta as i32;
        p.clamp(0, MAX_PRIORITIES as i32 - 1) as u8
    }

    /// Recomputes the bonus and time slice; called on every requeue.
    pub fn refresh(&mut self) {
        self.bonus_delta = interactivity_bonus(self.cpu_time, self.sleep_time);
        self.time_slice = time_slice_for(self.effective_priority());
    }
}

/// Maps the interactivity ratio `(sleep + 1) / (cpu + sleep)` to a signed
/// bonus in `[-MAX_BONUS, MAX_BONUS]`. Sleep-heavy tasks get a negative
/// delta (numerically better priority).
#[must_use]
pub fn interactivity_bonus(cpu_time: u64, sleep_time: u64) -> i8 {
    let denom = (cpu_time + sleep_time).max(1);
    let ratio = (((sleep_time + 1) << RATIO_SHIFT) / denom).min(1 << RATIO_SHIFT);
    let scaled = (ratio * (2 * MAX_BONUS as u64)) >> RATIO_SHIFT;
    MAX_BONUS - scaled as i8
}

/// Time slice for an effective priority.
///
/// `reverse = MAX - p`; the raw weight is `log2(reverse²)`, scaled into
/// `[MIN_TIME_SLICE, MAX_TIME_SLICE]`.
#[must_use]
pub fn time_slice_for(priority: u8) -> u32 {
    let reverse = (MAX_PRIORITIES as u32) - priority as u32;
    let raw = 2 * reverse.ilog2();
    let max_raw = 2 * (MAX_PRIORITIES as u32).ilog2();
    MIN_TIME_SLICE + raw * (MAX_TIME_SLICE - MIN_TIME_SLICE) / max_raw
}

/// Page-table activation seam implemented by the kernel's address spaces.
pub trait AddressSpaceHook: Send + Sync {
    /// Makes this address space current on the executing CPU.
    fn activate(&self);
}

/// Task payload variant.
pub enum TaskKind {
    /// In-kernel thread.
    Kernel {
        /// Thread name for diagnostics.
        name: &'static str,
    },
    /// User thread; the payload is the owning process.
    User {
        /// Downcast by the process layer.
        payload: Arc<dyn Any + Send + Sync>,
    },
}

/// A schedulable task.
pub struct Task {
    node: Node<Task>,
    sleep: AtomicU8,
    cpu: AtomicU32,
    /// Scheduling stats; the lock serialises scheduler decisions
    /// involving this task's queues and priorities.
    pub stats: IrqSpinLock<SchedStats>,
    kind: TaskKind,
    space: Option<Arc<dyn AddressSpaceHook>>,
    entry: fn(usize),
    entry_arg: usize,
    pub(crate) context: UnsafeCell<Context>,
    stack: KernelStack,
}

// SAFETY: The context cell is only touched by the owning CPU during a
// switch, under the scheduler queue lock; everything else is atomic or
// lock-guarded.
unsafe impl Send for Task {}
// SAFETY: As above.
unsafe impl Sync for Task {}

// SAFETY: `node` is the embedded link node and the task lives behind a
// stable Arc allocation while queued.
unsafe impl Linked for Task {
    fn node(&self) -> &Node<Self> {
        &self.node
    }
}

impl Task {
    fn build(
        kind: TaskKind,
        space: Option<Arc<dyn AddressSpaceHook>>,
        entry: fn(usize),
        entry_arg: usize,
        static_delta: i8,
    ) -> Result<Arc<Self>> {
        let stack = KernelStack::alloc()?;
        let mut context = Context::new();
        // SAFETY: The stack top is page-aligned with the whole stack below.
        unsafe {
            arch::init_context(
                &mut context,
                stack.top().as_ptr(),
                crate::scheduler::task_entry_thunk,
            );
        }
        Ok(Arc::new(Self {
            node: Node::new(),
            sleep: AtomicU8::new(SleepState::Awake as u8),
            cpu: AtomicU32::new(0),
            stats: IrqSpinLock::new(SchedStats::new(static_delta)),
            kind,
            space,
            entry,
            entry_arg,
            context: UnsafeCell::new(context),
            stack,
        }))
    }

    /// Creates a kernel thread; does not enqueue it.
    ///
    /// # Errors
    ///
    /// Returns `NoMemory` when the kernel stack cannot be allocated.
    pub fn new_kernel(
        name: &'static str,
        entry: fn(usize),
        entry_arg: usize,
        static_delta: i8,
    ) -> Result<Arc<Self>> {
        Self::build(TaskKind::Kernel { name }, None, entry, entry_arg, static_delta)
    }

    /// Creates a user thread bound to a process payload and address space.
    ///
    /// # Errors
    ///
    /// Returns `NoMemory` when the kernel stack cannot be allocated.
    pub fn new_user(
        payload: Arc<dyn Any + Send + Sync>,
        space: Arc<dyn AddressSpaceHook>,
        entry: fn(usize),
        entry_arg: usize,
        static_delta: i8,
    ) -> Result<Arc<Self>> {
        Self::build(
            TaskKind::User { payload },
            Some(space),
            entry,
            entry_arg,
            static_delta,
        )
    }

    /// Task name for diagnostics.
    #[must_use]
    pub fn name(&self) -> &str {
        match &self.kind {
            TaskKind::Kernel { name } => name,
            TaskKind::User { .. } => "user",
        }
    }

    /// Payload variant.
    #[must_use]
    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    /// The user payload, if this is a user task.
    #[must_use]
    pub fn user_payload(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        match &self.kind {
            TaskKind::User { payload } => Some(payload),
            TaskKind::Kernel { .. } => None,
        }
    }

    /// Address space to activate when this task runs.
    #[must_use]
    pub fn address_space(&self) -> Option<&Arc<dyn AddressSpaceHook>> {
        self.space.as_ref()
    }

    /// Top of this task's kernel stack (syscall re-entry point).
    #[must_use]
    pub fn kernel_stack_top(&self) -> u64 {
        self.stack.top().as_ptr() as u64
    }

    /// CPU this task is pinned to.
    #[must_use]
    pub fn cpu(&self) -> CpuId {
        CpuId::new(self.cpu.load(Ordering::Relaxed))
    }

    pub(crate) fn set_cpu(&self, cpu: CpuId) {
        self.cpu.store(cpu.as_u32(), Ordering::Relaxed);
    }

    pub(crate) fn run_entry(&self) {
        (self.entry)(self.entry_arg);
    }

    /// Current sleep state.
    #[must_use]
    pub fn sleep_state(&self) -> SleepState {
        SleepState::from_raw(self.sleep.load(Ordering::Acquire))
    }

    /// Effective priority snapshot (takes the stats lock).
    #[must_use]
    pub fn priority(&self) -> u8 {
        self.stats.lock().effective_priority()
    }

    fn transition(&self, from: SleepState, to: SleepState) -> bool {
        self.sleep
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Starts the sleep transition: `Awake → FallingAsleep`.
    ///
    /// # Panics
    ///
    /// Panics if the task was not awake — only a running task may decide
    /// to sleep.
    pub fn begin_sleep(&self) {
        assert!(
            self.transition(SleepState::Awake, SleepState::FallingAsleep),
            "begin_sleep on a non-awake task"
        );
    }

    /// Wakes the task, resolving the race with a concurrent sleep.
    pub fn try_wakeup(&self) -> WakeAction {
        if self.transition(SleepState::FallingAsleep, SleepState::NeedsWakeup) {
            return WakeAction::Deferred;
        }
        if self.transition(SleepState::Sleeping, SleepState::Awake) {
            return WakeAction::Runnable;
        }
        WakeAction::AlreadyAwake
    }

    /// Completes the sleep transition after the task has switched out.
    ///
    /// Returns `true` if the task is now sleeping, `false` if a deferred
    /// wakeup arrived and the task must be requeued (its state is already
    /// back to `Awake`).
    pub(crate) fn finish_sleep(&self) -> bool {
        if self.transition(SleepState::FallingAsleep, SleepState::Sleeping) {
            return true;
        }
        assert!(
            self.transition(SleepState::NeedsWakeup, SleepState::Awake),
            "finish_sleep raced an invalid state"
        );
        false
    }

    /// Clears a deferred wakeup without switching out (fast path in
    /// `wait` when the wakeup arrived before the switch).
    pub(crate) fn cancel_sleep_if_woken(&self) -> bool {
        self.transition(SleepState::NeedsWakeup, SleepState::Awake)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bonus_rewards_sleepers() {
        // Pure CPU hog: worst (positive) delta.
        assert_eq!(interactivity_bonus(1000, 0), MAX_BONUS);
        // Pure sleeper: best (negative) delta.
        assert!(interactivity_bonus(0, 1000) <= -(MAX_BONUS - 1));
        // Balanced: near zero.
        let mid = interactivity_bonus(500, 500);
        assert!(mid.abs() <= 1, "balanced bonus {mid} should be near zero");
    }

    #[test]
    fn bonus_is_monotonic_in_sleep_share() {
        let mut last = MAX_BONUS;
        for sleep in [0u64, 100, 300, 500, 700, 900, 1000] {
            let b = interactivity_bonus(1000 - sleep.min(1000), sleep);
            assert!(b <= last);
            last = b;
        }
    }

    #[test]
    fn time_slice_scales_with_priority() {
        // Best priority (0) gets the longest slice.
        assert_eq!(time_slice_for(0), MAX_TIME_SLICE);
        // Worst priority (31) gets the shortest.
        assert_eq!(time_slice_for(31), MIN_TIME_SLICE);
        // Monotonically non-increasing in between.
        let mut last = u32::MAX;
        for p in 0..MAX_PRIORITIES as u8 {
            let slice = time_slice_for(p);
            assert!(slice <= last);
            assert!((MIN_TIME_SLICE..=MAX_TIME_SLICE).contains(&slice));
            last = slice;
        }
    }

    #[test]
    fn effective_priority_clamps() {
        let mut stats = SchedStats::new(100);
        assert_eq!(stats.effective_priority(), MAX_PRIORITIES as u8 - 1);
        stats.static_delta = -100;
        assert_eq!(stats.effective_priority(), 0);
    }

    #[test]
    fn interactivity_bonus_law() {
        // A task that sleeps 90% of the time keeps a better-than-base
        // priority across repeated requeues.
        let mut stats = SchedStats::new(0);
        for round in 1..=100u64 {
            stats.cpu_time = round;
            stats.sleep_time = round * 9;
            stats.refresh();
            assert!(stats.effective_priority() < BASE_PRIORITY);
        }
    }

    fn noop_entry(_: usize) {}

    #[test]
    fn sleep_state_machine_resolves_race() {
        crate::test_support::install_frames();
        let task = Task::new_kernel("state", noop_entry, 0, 0).unwrap();
        assert_eq!(task.sleep_state(), SleepState::Awake);

        // Wakeup while awake is a no-op.
        assert_eq!(task.try_wakeup(), WakeAction::AlreadyAwake);

        // Sleep vs wake race: wake lands between decide and switch-out.
        task.begin_sleep();
        assert_eq!(task.try_wakeup(), WakeAction::Deferred);
        assert_eq!(task.sleep_state(), SleepState::NeedsWakeup);
        // The sleeper observes the deferred wake when finishing.
        assert!(!task.finish_sleep());
        assert_eq!(task.sleep_state(), SleepState::Awake);

        // Uncontended sleep, then a wake from sleep.
        task.begin_sleep();
        assert!(task.finish_sleep());
        assert_eq!(task.sleep_state(), SleepState::Sleeping);
        assert_eq!(task.try_wakeup(), WakeAction::Runnable);
        assert_eq!(task.sleep_state(), SleepState::Awake);
    }

    #[test]
    fn wakeup_never_lost_under_contention() {
        use std::sync::atomic::AtomicBool;
        crate::test_support::install_frames();
        for _ in 0..200 {
            let task = Task::new_kernel("race", noop_entry, 0, 0).unwrap();
            task.begin_sleep();
            let woke_runnable = std::sync::Arc::new(AtomicBool::new(false));

            let t2 = {
                let task = task.clone();
                let woke = woke_runnable.clone();
                std::thread::spawn(move || match task.try_wakeup() {
                    WakeAction::Runnable => woke.store(true, Ordering::SeqCst),
                    WakeAction::Deferred | WakeAction::AlreadyAwake => {}
                })
            };
            let slept = task.finish_sleep();
            t2.join().unwrap();

            if slept {
                // The sleeper won the transition to Sleeping, so the waker
                // must have observed Sleeping and woken it.
                assert!(woke_runnable.load(Ordering::SeqCst));
            }
            // Either way the wakeup was not lost: the task ends awake.
            assert_eq!(task.sleep_state(), SleepState::Awake);
        }
    }
}
