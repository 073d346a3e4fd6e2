//! Wait queues.
//!
//! A wait queue is a lock-free forward list of stack-allocated entries,
//! one per blocked task. Waiters enroll *before* establishing the wakeup
//! condition (submit, event push), so a wakeup can never slip between the
//! check and the sleep. [`WaitQueue::wake_all`] is safe from IRQ context:
//! it only drains the atomic list and performs CAS wakeups.
//!
//! Each entry holds a strong task reference; while a task sleeps, that
//! reference is what keeps it (and its kernel stack) alive after the
//! scheduler has handed its own reference off.

use alloc::sync::Arc;
use core::ptr::NonNull;

use boson_core::list::{AtomicForwardList, ForwardLinked, ForwardNode};

use crate::scheduler;
use crate::task::{Task, WakeAction};

/// One blocked task, spliced into a [`WaitQueue`].
///
/// Lives on the waiter's kernel stack for the duration of the wait.
pub struct WaitEntry {
    fwd: ForwardNode<WaitEntry>,
    task: Arc<Task>,
    enqueued_at: u64,
}

// SAFETY: `fwd` is the embedded forward link node.
unsafe impl ForwardLinked for WaitEntry {
    fn forward_node(&self) -> &ForwardNode<Self> {
        &self.fwd
    }
}

impl WaitEntry {
    /// Creates an entry for `task`, stamped with the current tick.
    #[must_use]
    pub fn new(task: Arc<Task>) -> Self {
        Self {
            fwd: ForwardNode::new(),
            task,
            enqueued_at: scheduler::now_ticks(),
        }
    }

    /// The blocked task.
    #[must_use]
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }
}

/// A FIFO of tasks blocked on one condition, woken en masse.
pub struct WaitQueue {
    entries: AtomicForwardList<WaitEntry>,
}

impl WaitQueue {
    /// Creates an empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: AtomicForwardList::new(),
        }
    }

    /// Returns whether any waiter is currently enrolled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Splices a waiter in.
    ///
    /// # Safety
    ///
    /// `entry` must stay pinned and alive until a `wake_all` drains it;
    /// the standard pattern is a stack entry inside a function that does
    /// not return before sleeping and being woken.
    pub unsafe fn enroll(&self, entry: &WaitEntry) {
        // SAFETY: Caller guarantees the entry outlives its queue linkage.
        unsafe { self.entries.push(NonNull::from(entry)) };
    }

    /// Wakes every enrolled task. Safe from IRQ context.
    ///
    /// Sleeping tasks are re-enqueued on their pinned CPU; tasks still
    /// falling asleep observe the deferred wakeup when they finish
    /// switching out. Returns the number of entries drained.
    pub fn wake_all(&self) -> usize {
        let now = scheduler::now_ticks();
        let mut woken = 0;
        for entry_ptr in self.entries.take_all() {
            // SAFETY: Entries stay alive until drained (enroll contract).
            let entry = unsafe { entry_ptr.as_ref() };
            // Snapshot the task before the wakeup: the instant the waiter
            // observes it, the stack entry may be popped.
            let task = entry.task.clone();
            let slept = now.saturating_sub(entry.enqueued_at);
            match task.try_wakeup() {
                WakeAction::Runnable => {
                    // Credit the sleep for the interactivity bonus; skip on
                    // contention rather than spinning in IRQ context.
                    if let Some(mut stats) = task.stats.try_lock() {
                        stats.sleep_time += slept;
                    }
                    scheduler::enqueue_woken(task);
                }
                WakeAction::Deferred | WakeAction::AlreadyAwake => {}
            }
            woken += 1;
        }
        woken
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::SleepState;

    fn noop(_: usize) {}

    #[test]
    fn wake_all_on_empty_queue() {
        let q = WaitQueue::new();
        assert!(q.is_empty());
        assert_eq!(q.wake_all(), 0);
    }

    #[test]
    fn deferred_wake_is_observed_by_sleeper() {
        crate::test_support::install_frames();
        let task = Task::new_kernel("wq", noop, 0, 0).unwrap();
        task.begin_sleep();

        let q = WaitQueue::new();
        let entry = WaitEntry::new(task.clone());
        unsafe { q.enroll(&entry) };
        assert!(!q.is_empty());

        // Wake while the task is still falling asleep: deferred.
        assert_eq!(q.wake_all(), 1);
        assert_eq!(task.sleep_state(), SleepState::NeedsWakeup);
        assert!(q.is_empty());

        // The sleeper's switch-out path resolves it back to awake.
        assert!(!task.finish_sleep());
        assert_eq!(task.sleep_state(), SleepState::Awake);
    }

    #[test]
    fn sleeping_task_is_requeued_on_wake() {
        crate::test_support::install_frames();
        let task = Task::new_kernel("wq2", noop, 0, 0).unwrap();
        task.begin_sleep();
        assert!(task.finish_sleep());

        let q = WaitQueue::new();
        let entry = WaitEntry::new(task.clone());
        unsafe { q.enroll(&entry) };

        let ready_before = scheduler::scheduler().ready_count();
        assert_eq!(q.wake_all(), 1);
        assert_eq!(task.sleep_state(), SleepState::Awake);
        assert_eq!(scheduler::scheduler().ready_count(), ready_before + 1);
        // Leave the scheduler clean for other tests.
        scheduler::scheduler().drain_for_test();
    }
}
