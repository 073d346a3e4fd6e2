//! Per-CPU scheduler instances and the scheduling entry points.
//!
//! Each CPU owns a [`CpuScheduler`]: dual priority arrays behind the
//! queue lock, the current task slot, a preemption counter, and the
//! `need_resched` flag. Tasks never migrate after their first enqueue;
//! only initial placement picks the least-loaded CPU.
//!
//! # Switch protocol
//!
//! `reschedule` pops the next task under the queue lock, publishes the
//! outgoing task in the `switching_from` slot, releases the lock, and
//! performs the context switch. The first thing the incoming side runs —
//! whether a resumed task, a fresh task's entry thunk, or the idle loop —
//! is [`CpuScheduler::post_switch`], which finalizes the outgoing task's
//! `falling_asleep → sleep` transition (requeueing it instead when a
//! deferred wakeup arrived), activates the incoming task's address space,
//! and resets the preemption counter.

use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

use boson_core::id::CpuId;
use boson_core::list::Linked;
use boson_core::percpu::{self, CpuLocal, MAX_CPUS};
use boson_core::sync::IrqSpinLock;
use boson_core::{Result, kdebug, ktrace};

use crate::arch::{self, Context};
use crate::queue::RunQueues;
use crate::task::{SleepState, Task};
use crate::waitq::WaitEntry;

// ---------------------------------------------------------------------------
// Registered hooks
// ---------------------------------------------------------------------------

/// Signature of the registered scheduler tick source.
pub type TickFn = fn() -> u64;

fn zero_ticks() -> u64 {
    0
}

static TICK_FN: AtomicPtr<()> = AtomicPtr::new(zero_ticks as *mut ());

/// Registers the tick source used for wait timestamps and sleep credit.
pub fn set_tick_source(f: TickFn) {
    TICK_FN.store(f as *mut (), Ordering::Release);
}

/// Current tick count from the registered source (0 before registration).
#[must_use]
pub fn now_ticks() -> u64 {
    let ptr = TICK_FN.load(Ordering::Acquire);
    // SAFETY: TICK_FN only ever holds a valid `TickFn`.
    let f: TickFn = unsafe { core::mem::transmute(ptr) };
    f()
}

fn noop_kernel_space() {}

static KERNEL_SPACE_FN: AtomicPtr<()> = AtomicPtr::new(noop_kernel_space as *mut ());

/// Registers the hook that activates the kernel page table, run when a
/// task without its own address space is switched in.
pub fn set_kernel_space_hook(f: fn()) {
    KERNEL_SPACE_FN.store(f as *mut (), Ordering::Release);
}

fn activate_kernel_space() {
    let ptr = KERNEL_SPACE_FN.load(Ordering::Acquire);
    // SAFETY: The slot only ever holds a valid `fn()`.
    let f: fn() = unsafe { core::mem::transmute(ptr) };
    f();
}

// ---------------------------------------------------------------------------
// Per-CPU scheduler
// ---------------------------------------------------------------------------

/// Scheduler state for one CPU.
pub struct CpuScheduler {
    /// Active/expired priority arrays; the queue structure lock.
    queues: IrqSpinLock<RunQueues>,
    /// Currently running task (owns one reference); null when idle.
    current: AtomicPtr<Task>,
    /// Outgoing task handed across a context switch (owns one reference).
    switching_from: AtomicPtr<Task>,
    /// Set when a better task is ready or a slice expired.
    need_resched: AtomicBool,
    /// Nested preemption-disable counter; 0 means preemptive.
    preempt_count: AtomicU32,
    /// Interrupt nesting depth on this CPU.
    irq_nesting: AtomicU32,
    /// Saved context of the idle loop (the CPU's boot stack).
    idle_context: UnsafeCell<Context>,
    /// Paused tasks, not eligible to run until resumed.
    paused: IrqSpinLock<crate::queue::PrioQueue>,
}

// SAFETY: Queue state is lock-guarded; the raw slots are atomics whose
// ownership discipline is documented on each method.
unsafe impl Send for CpuScheduler {}
// SAFETY: As above.
unsafe impl Sync for CpuScheduler {}

static SCHEDULERS: CpuLocal<CpuScheduler> =
    CpuLocal::new([const { CpuScheduler::new() }; MAX_CPUS]);

/// Returns the current CPU's scheduler.
#[must_use]
pub fn scheduler() -> &'static CpuScheduler {
    SCHEDULERS.get()
}

/// Returns a specific CPU's scheduler.
#[must_use]
pub fn scheduler_for(cpu: CpuId) -> &'static CpuScheduler {
    SCHEDULERS.get_for(cpu)
}

impl CpuScheduler {
    const fn new() -> Self {
        Self {
            queues: IrqSpinLock::new(RunQueues::new()),
            current: AtomicPtr::new(ptr::null_mut()),
            switching_from: AtomicPtr::new(ptr::null_mut()),
            need_resched: AtomicBool::new(false),
            preempt_count: AtomicU32::new(0),
            irq_nesting: AtomicU32::new(0),
            idle_context: UnsafeCell::new(Context::new()),
            paused: IrqSpinLock::new(crate::queue::PrioQueue::new()),
        }
    }

    /// Borrows the running task. Only meaningful on the owning CPU, where
    /// `current` cannot change underneath the caller.
    fn current_ref(&self) -> Option<&Task> {
        let ptr = self.current.load(Ordering::Acquire);
        // SAFETY: The slot owns a reference, so the task is alive; only
        // the owning CPU swaps the slot.
        unsafe { ptr.as_ref() }
    }

    /// Clones a reference to the running task (owning CPU only).
    #[must_use]
    pub fn current_arc(&self) -> Option<Arc<Task>> {
        let ptr = self.current.load(Ordering::Acquire);
        if ptr.is_null() {
            return None;
        }
        // SAFETY: The slot owns a reference and only the owning CPU swaps
        // it, so the task is alive for the duration of this call.
        unsafe {
            Arc::increment_strong_count(ptr);
            Some(Arc::from_raw(ptr))
        }
    }

    /// Number of tasks queued to run on this CPU.
    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.queues.lock().total_len()
    }

    /// The `need_resched` flag.
    #[must_use]
    pub fn need_resched(&self) -> bool {
        self.need_resched.load(Ordering::Acquire)
    }

    /// Requests a reschedule at the next safe point.
    pub fn set_need_resched(&self) {
        self.need_resched.store(true, Ordering::Release);
    }

    /// Current preemption-disable depth.
    #[must_use]
    pub fn preempt_depth(&self) -> u32 {
        self.preempt_count.load(Ordering::Acquire)
    }

    /// Records an interrupt entry; returns the new depth.
    pub fn irq_enter(&self) -> u32 {
        self.irq_nesting.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Records an interrupt exit; returns the new depth.
    pub fn irq_exit(&self) -> u32 {
        self.irq_nesting.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Current interrupt nesting depth.
    #[must_use]
    pub fn irq_depth(&self) -> u32 {
        self.irq_nesting.load(Ordering::Acquire)
    }

    // -- Enqueue / preempt ------------------------------------------------

    /// Enqueues an awake task on this CPU (`cpu` names this scheduler).
    ///
    /// Refreshes the bonus and time slice, then tries preemption; if the
    /// task does not outrank the running one it lands on the expired
    /// queue.
    pub fn enqueue(&self, cpu: CpuId, task: Arc<Task>) {
        debug_assert_eq!(task.sleep_state(), SleepState::Awake);
        debug_assert!(
            {
                let probe = task.stats.try_lock().is_some();
                probe
            },
            "stats lock held across enqueue"
        );
        task.set_cpu(cpu);
        let priority = {
            let mut stats = task.stats.lock();
            stats.refresh();
            stats.effective_priority()
        };
        ktrace!("enqueue '{}' prio={} cpu={}", task.name(), priority, cpu);
        let _preempted = self.try_preempt(cpu, priority, task);
    }

    /// Attempts to have `task` preempt the running task.
    ///
    /// On success both tasks are pushed onto the *active* queue and
    /// `need_resched` is set; if this is the executing CPU, outside IRQ
    /// context, with preemption enabled, the switch happens immediately.
    /// On failure the task is pushed onto the *expired* queue. Always
    /// consumes the task reference; returns whether preemption won.
    fn try_preempt(&self, cpu: CpuId, priority: u8, task: Arc<Task>) -> bool {
        let on_this_cpu = percpu::current_cpu() == cpu;

        // Cross-CPU enqueue never compares against the remote running
        // task (its slot may change underneath us); the remote CPU acts
        // on need_resched at its next tick.
        let current_priority = if on_this_cpu {
            self.current_ref().map(|cur| cur.priority())
        } else {
            None
        };

        let wins = match current_priority {
            Some(cur_prio) => priority < cur_prio,
            // Idle or remote: queue on expired unless idle on this CPU.
            None => on_this_cpu,
        };

        if !wins {
            let mut queues = self.queues.lock();
            queues.expired().push(priority, task);
            if !on_this_cpu {
                self.set_need_resched();
            }
            return false;
        }

        {
            let mut queues = self.queues.lock();
            queues.active().push(priority, task);
            // The displaced task keeps running until the switch; queue it
            // so reschedule finds it again (unless it is already queued).
            let displaced = match self.current_ref() {
                Some(cur) if !cur.node().is_linked() => self.current_arc(),
                _ => None,
            };
            if let Some(cur) = displaced {
                let cur_prio = cur.priority();
                queues.active().push(cur_prio, cur);
            }
        }
        self.set_need_resched();

        if on_this_cpu
            && self.current_ref().is_some()
            && self.irq_depth() == 0
            && self.preempt_depth() == 0
        {
            disable_preemption();
            self.reschedule();
        }
        true
    }

    // -- Timer ------------------------------------------------------------

    /// Charges `elapsed` ticks to the running task. IRQ context.
    ///
    /// When the slice is exhausted the task moves to the expired queue
    /// and `need_resched` is set. Uses `try_lock` on the stats: if the
    /// lock is contended, the holder is mid-decision and this tick is
    /// deferred to it.
    pub fn timer_event(&self, elapsed: u64) {
        let Some(cur) = self.current_ref() else {
            return;
        };
        let Some(mut stats) = cur.stats.try_lock() else {
            return;
        };
        stats.cpu_time += elapsed;
        if stats.time_slice > elapsed as u32 {
            stats.time_slice -= elapsed as u32;
            return;
        }
        stats.time_slice = 0;
        stats.refresh();
        let priority = stats.effective_priority();
        drop(stats);

        if !cur.node().is_linked() {
            if let Some(cur) = self.current_arc() {
                self.queues.lock().expired().push(priority, cur);
            }
        }
        self.set_need_resched();
    }

    // -- Reschedule -------------------------------------------------------

    /// Picks the next task and switches to it.
    ///
    /// Precondition: preemption disabled by exactly one level, and the
    /// running task is either queued somewhere or falling asleep.
    pub fn reschedule(&self) {
        debug_assert_eq!(self.preempt_depth(), 1, "reschedule needs one disable level");
        debug_assert!(self.irq_depth() == 0, "reschedule inside an interrupt");
        self.need_resched.store(false, Ordering::Release);

        let cur_ptr = self.current.load(Ordering::Acquire);
        let cur_awake = self
            .current_ref()
            .is_some_and(|cur| cur.sleep_state() == SleepState::Awake);

        let next_ptr = loop {
            let popped = { self.queues.lock().pop_next() };
            let Some((_, next)) = popped else {
                break ptr::null_mut();
            };
            let next_ptr = Arc::into_raw(next).cast_mut();
            if next_ptr != cur_ptr {
                break next_ptr;
            }
            // Popped ourselves (queued by the preempt path).
            // SAFETY: Balances the reference taken out of the queue.
            drop(unsafe { Arc::from_raw(next_ptr.cast_const()) });
            if cur_awake {
                // Still the best runnable task: keep running.
                self.preempt_count.store(0, Ordering::Release);
                return;
            }
            // Falling asleep: the queue entry was stale; keep popping.
        };

        if next_ptr.is_null() {
            // Nothing else runnable.
            if cur_awake {
                self.preempt_count.store(0, Ordering::Release);
                return;
            }
            // Going idle: the outgoing task (if any) is falling asleep.
            let prev = self.current.swap(ptr::null_mut(), Ordering::AcqRel);
            self.switching_from.store(prev, Ordering::Release);
            let old_ctx = if prev.is_null() {
                self.idle_context.get()
            } else {
                // SAFETY: The slot owned a reference; the task is alive.
                unsafe { (*prev).context.get() }
            };
            // SAFETY: Both contexts are valid; preemption is disabled.
            unsafe { arch::switch_context(old_ctx, self.idle_context.get()) };
            self.post_switch();
            return;
        }

        let prev = self.current.swap(next_ptr, Ordering::AcqRel);
        self.switching_from.store(prev, Ordering::Release);

        let old_ctx = if prev.is_null() {
            self.idle_context.get()
        } else {
            // SAFETY: We owned the slot's reference; the task is alive.
            unsafe { (*prev).context.get() }
        };
        // SAFETY: `next` came off the run queue with a valid context.
        let new_ctx = unsafe { (*next_ptr).context.get() };

        // SAFETY: Contexts are valid and preemption is disabled; the
        // incoming side runs post_switch first.
        unsafe { arch::switch_context(old_ctx, new_ctx) };

        // We have been switched back in; finalize the task we came from.
        self.post_switch();
    }

    /// Post-switch hook, run as the first action on the incoming side.
    pub(crate) fn post_switch(&self) {
        let prev = self.switching_from.swap(ptr::null_mut(), Ordering::AcqRel);
        if !prev.is_null() {
            // SAFETY: The slot owned one reference; take it over.
            let prev = unsafe { Arc::from_raw(prev.cast_const()) };
            match prev.sleep_state() {
                SleepState::FallingAsleep | SleepState::NeedsWakeup => {
                    if !prev.finish_sleep() {
                        // A wakeup raced the switch: back onto the active
                        // queue of its pinned CPU.
                        let priority = prev.stats.lock().effective_priority();
                        let target = scheduler_for(prev.cpu());
                        target.queues.lock().active().push(priority, prev);
                        target.set_need_resched();
                    }
                    // Now sleeping: the wait entry's reference keeps the
                    // task alive; ours drops here.
                }
                SleepState::Awake => {
                    // Preempted or expired: its queue entry owns its own
                    // reference; drop the slot's.
                }
                SleepState::Sleeping => unreachable!("outgoing task already sleeping"),
            }
        }

        match self.current_ref() {
            Some(cur) => match cur.address_space() {
                Some(space) => space.activate(),
                None => activate_kernel_space(),
            },
            None => activate_kernel_space(),
        }

        self.preempt_count.store(0, Ordering::Release);
    }

    // -- Idle -------------------------------------------------------------

    /// Turns the calling context into this CPU's idle loop. Never returns.
    ///
    /// The boot stack becomes the idle stack; its context is saved on the
    /// first switch away.
    pub fn idle_loop(&self) -> ! {
        loop {
            let has_work = { self.queues.lock().total_len() > 0 };
            if !has_work {
                arch::halt_until_interrupt();
                continue;
            }
            self.need_resched.store(false, Ordering::Release);
            disable_preemption();
            let next = { self.queues.lock().pop_next() };
            let Some((_, next)) = next else {
                self.preempt_count.store(0, Ordering::Release);
                continue;
            };
            let next_ptr = Arc::into_raw(next).cast_mut();
            self.current.store(next_ptr, Ordering::Release);
            self.switching_from.store(ptr::null_mut(), Ordering::Release);
            // SAFETY: `next` has a valid context; idle_context receives
            // this loop's state for the switch back.
            unsafe {
                arch::switch_context(self.idle_context.get(), (*next_ptr).context.get());
            }
            // A task switched back to idle; finalize it.
            self.post_switch();
        }
    }

    // -- Pause / resume ---------------------------------------------------

    /// Removes a queued task from the run queues into the pause queue.
    ///
    /// A running or sleeping task cannot be paused; returns whether the
    /// task was found and moved.
    pub fn pause(&self, task: &Arc<Task>) -> bool {
        let mut queues = self.queues.lock();
        let Some((which, priority)) = queues.position_of(task) else {
            return false;
        };
        // SAFETY: position_of proved membership at (which, priority).
        let owned = unsafe { queues.queue_mut(which).remove(priority, task) };
        drop(queues);
        self.paused.lock().push(priority, owned);
        true
    }

    /// Moves every paused task back onto the expired queue.
    pub fn resume_all(&self) -> usize {
        let mut moved = 0;
        loop {
            let entry = self.paused.lock().pop();
            let Some((priority, task)) = entry else {
                break;
            };
            self.queues.lock().expired().push(priority, task);
            moved += 1;
        }
        moved
    }

    /// Drops every queued task; unit-test housekeeping.
    #[cfg(test)]
    pub(crate) fn drain_for_test(&self) {
        while self.queues.lock().pop_next().is_some() {}
    }
}

// ---------------------------------------------------------------------------
// Free-function API (current CPU)
// ---------------------------------------------------------------------------

/// Clones a reference to the task running on this CPU.
#[must_use]
pub fn current_task() -> Option<Arc<Task>> {
    scheduler().current_arc()
}

/// Disables preemption on this CPU (nested).
pub fn disable_preemption() {
    scheduler().preempt_count.fetch_add(1, Ordering::AcqRel);
}

/// Enables preemption on this CPU; at depth zero a pending reschedule
/// request is honoured immediately.
pub fn enable_preemption() {
    let sch = scheduler();
    let depth = sch.preempt_count.fetch_sub(1, Ordering::AcqRel) - 1;
    if depth == 0 && sch.need_resched() && sch.irq_depth() == 0 && sch.current_ref().is_some() {
        disable_preemption();
        sch.reschedule();
    }
}

/// Enqueues a task on its pinned CPU.
pub fn enqueue_task(task: Arc<Task>) {
    let cpu = task.cpu();
    scheduler_for(cpu).enqueue(cpu, task);
}

/// First enqueue of a fresh task: picks the least-loaded CPU, pinning
/// the task there for its lifetime.
pub fn enqueue_task_balanced(task: Arc<Task>) {
    let cpu = least_loaded_cpu();
    task.set_cpu(cpu);
    scheduler_for(cpu).enqueue(cpu, task);
}

/// Enqueues a task woken from sleep (wait-queue path).
pub(crate) fn enqueue_woken(task: Arc<Task>) {
    enqueue_task(task);
}

/// Creates and enqueues a kernel thread, placing it on the CPU with the
/// shortest run queue.
///
/// # Errors
///
/// Returns `NoMemory` when the kernel stack cannot be allocated.
pub fn spawn_kernel(
    name: &'static str,
    entry: fn(usize),
    entry_arg: usize,
    static_delta: i8,
) -> Result<Arc<Task>> {
    let task = Task::new_kernel(name, entry, entry_arg, static_delta)?;
    kdebug!("spawn '{name}'");
    enqueue_task_balanced(task.clone());
    Ok(task)
}

/// Initial-placement balancing: the CPU with the fewest queued tasks.
#[must_use]
pub fn least_loaded_cpu() -> CpuId {
    let mut best = CpuId::new(0);
    let mut best_len = usize::MAX;
    for cpu in 0..percpu::cpu_count() {
        let id = CpuId::new(cpu);
        let len = scheduler_for(id).ready_count();
        if len < best_len {
            best_len = len;
            best = id;
        }
    }
    best
}

/// Voluntarily gives up the CPU, crediting the rest of the slice as sleep
/// time for the interactivity ratio.
pub fn yield_now() {
    let sch = scheduler();
    let Some(cur) = sch.current_arc() else {
        return;
    };
    let priority = {
        let mut stats = cur.stats.lock();
        stats.sleep_time += stats.time_slice as u64;
        stats.refresh();
        stats.effective_priority()
    };
    if !cur.node().is_linked() {
        sch.queues.lock().expired().push(priority, cur);
    }
    disable_preemption();
    sch.reschedule();
}

/// Begins a wait: transitions the running task to `falling_asleep` and
/// returns the entry to splice into a wait queue.
///
/// Returns `None` when no task context exists yet (early boot), in which
/// case the caller must poll instead of sleeping.
#[must_use]
pub fn init_wait() -> Option<WaitEntry> {
    let cur = current_task()?;
    cur.begin_sleep();
    Some(WaitEntry::new(cur))
}

/// Completes a wait begun with [`init_wait`] after the entry has been
/// enrolled: switches away until the wakeup arrives.
///
/// If the wakeup already arrived (the enroll → establish-condition →
/// wait ordering makes this common for fast devices), returns without
/// switching.
pub fn wait() {
    let sch = scheduler();
    let Some(cur) = sch.current_arc() else {
        return;
    };
    disable_preemption();
    if cur.cancel_sleep_if_woken() {
        // Wakeup won the race before we switched out.
        sch.preempt_count.store(0, Ordering::Release);
        return;
    }
    sch.reschedule();
}

/// Terminates the running task. Its reference is dropped after the
/// switch; the kernel stack is reclaimed when the last reference goes.
pub fn exit_current() -> ! {
    let sch = scheduler();
    let cur = sch.current_arc().expect("exit_current without a task");
    ktrace!("task '{}' exiting", cur.name());
    // The preempt path may have queued us; a dead task must not be
    // popped later, so unlink first.
    if cur.node().is_linked() {
        let mut queues = sch.queues.lock();
        if let Some((which, priority)) = queues.position_of(&cur) {
            // SAFETY: position_of proved membership.
            drop(unsafe { queues.queue_mut(which).remove(priority, &cur) });
        }
    }
    // A task that will never be woken: the post-switch path sees the
    // falling-asleep state and drops the scheduler's reference.
    cur.begin_sleep();
    drop(cur);
    disable_preemption();
    sch.reschedule();
    unreachable!("exited task was rescheduled");
}

/// Charges timer ticks to the running task on this CPU. IRQ context.
pub fn timer_event(elapsed: u64) {
    scheduler().timer_event(elapsed);
}

/// Interrupt-exit hook: reschedules if requested, safe, and preemptive.
///
/// `depth` is the nesting level being exited (1 = outermost handler).
pub fn maybe_resched_on_irq_exit(depth: u32) {
    let sch = scheduler();
    if depth == 1 && sch.need_resched() && sch.preempt_depth() == 0 && sch.current_ref().is_some() {
        disable_preemption();
        sch.reschedule();
    }
}

/// Adopts the calling context as the given task (boot, or host tests).
///
/// The task must not be queued anywhere; it becomes `current` on this
/// CPU without a context switch.
pub fn adopt_boot_task(task: Arc<Task>) {
    let sch = scheduler();
    task.set_cpu(percpu::current_cpu());
    let raw = Arc::into_raw(task).cast_mut();
    let old = sch.current.swap(raw, Ordering::AcqRel);
    if !old.is_null() {
        // SAFETY: The slot owned one reference to the previous task.
        drop(unsafe { Arc::from_raw(old.cast_const()) });
    }
}

/// Inverse of [`adopt_boot_task`]: detaches and returns the current
/// task without switching, leaving the CPU ownerless.
pub fn detach_boot_task() -> Option<Arc<Task>> {
    let sch = scheduler();
    let raw = sch.current.swap(ptr::null_mut(), Ordering::AcqRel);
    if raw.is_null() {
        return None;
    }
    // SAFETY: The slot owned one reference.
    Some(unsafe { Arc::from_raw(raw.cast_const()) })
}

/// Entry thunk every fresh task starts in: finalize the switch, run the
/// task body, exit.
pub(crate) extern "C" fn task_entry_thunk() -> ! {
    let sch = scheduler();
    sch.post_switch();
    let cur = sch.current_arc().expect("entry thunk without current task");
    cur.run_entry();
    drop(cur);
    exit_current()
}
