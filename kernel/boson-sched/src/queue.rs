//! Priority run queues.
//!
//! Each CPU owns two [`PrioQueue`]s, *active* and *expired*. Tasks run
//! from the active queue; exhausted or requeued tasks land on the expired
//! queue, and when the active queue drains the two swap roles. A
//! `last_min` scan position remembers the best occupied priority so
//! popping does not rescan the whole array every time.

use alloc::sync::Arc;
use core::ptr::NonNull;

use boson_core::list::List;

use crate::task::{MAX_PRIORITIES, Task};

/// One priority array: an intrusive list per priority level.
pub struct PrioQueue {
    lists: [List<Task>; MAX_PRIORITIES],
    size: usize,
    /// Lowest priority index that may hold a task; never overshoots.
    last_min: usize,
}

impl PrioQueue {
    /// Creates an empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lists: [const { List::new() }; MAX_PRIORITIES],
            size: 0,
            last_min: MAX_PRIORITIES,
        }
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Returns whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Enqueues a task at `priority`, taking over one reference.
    pub fn push(&mut self, priority: u8, task: Arc<Task>) {
        let priority = priority as usize;
        debug_assert!(priority < MAX_PRIORITIES);
        let raw = NonNull::new(Arc::into_raw(task).cast_mut()).expect("Arc pointer is non-null");
        // SAFETY: The Arc reference we just leaked keeps the task alive
        // until it is popped; a task is on at most one list at a time.
        unsafe { self.lists[priority].push_back(raw) };
        self.size += 1;
        if priority < self.last_min {
            self.last_min = priority;
        }
    }

    /// Pops the best-priority task, returning the reference taken by
    /// [`PrioQueue::push`].
    pub fn pop(&mut self) -> Option<(u8, Arc<Task>)> {
        if self.size == 0 {
            return None;
        }
        while self.last_min < MAX_PRIORITIES {
            if let Some(raw) = self.lists[self.last_min].pop_front() {
                self.size -= 1;
                // SAFETY: The pointer came from Arc::into_raw in push.
                let task = unsafe { Arc::from_raw(raw.as_ptr().cast_const()) };
                return Some((self.last_min as u8, task));
            }
            self.last_min += 1;
        }
        None
    }

    /// Finds the priority level a queued task sits at, by pointer walk.
    #[must_use]
    pub fn position_of(&self, task: &Arc<Task>) -> Option<u8> {
        let needle = Arc::as_ptr(task);
        for (priority, list) in self.lists.iter().enumerate() {
            if list.iter().any(|t| core::ptr::eq(t, needle)) {
                return Some(priority as u8);
            }
        }
        None
    }

    /// Unlinks a specific queued task (pause, exit while queued).
    ///
    /// # Safety
    ///
    /// `task` must currently be queued on *this* queue at `priority`.
    pub unsafe fn remove(&mut self, priority: u8, task: &Arc<Task>) -> Arc<Task> {
        let raw = NonNull::new(Arc::as_ptr(task).cast_mut()).expect("Arc pointer is non-null");
        // SAFETY: Caller guarantees membership.
        unsafe { self.lists[priority as usize].remove(raw) };
        self.size -= 1;
        // SAFETY: Reclaim the reference leaked by push.
        unsafe { Arc::from_raw(raw.as_ptr().cast_const()) }
    }
}

impl Default for PrioQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// The active/expired pair with O(1) swap.
pub struct RunQueues {
    queues: [PrioQueue; 2],
    active: usize,
}

impl RunQueues {
    /// Creates an empty pair.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            queues: [const { PrioQueue::new() }; 2],
            active: 0,
        }
    }

    /// The queue tasks run from.
    pub fn active(&mut self) -> &mut PrioQueue {
        &mut self.queues[self.active]
    }

    /// The queue requeued tasks land on.
    pub fn expired(&mut self) -> &mut PrioQueue {
        &mut self.queues[1 - self.active]
    }

    /// Swaps the roles of the two queues.
    pub fn swap(&mut self) {
        self.active = 1 - self.active;
    }

    /// Total queued tasks across both queues.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.queues[0].len() + self.queues[1].len()
    }

    /// Pops the next runnable task, swapping queues if the active side is
    /// drained.
    pub fn pop_next(&mut self) -> Option<(u8, Arc<Task>)> {
        if let Some(found) = self.active().pop() {
            return Some(found);
        }
        self.swap();
        self.active().pop()
    }

    /// Locates a queued task: which queue (0/1) and at what priority.
    #[must_use]
    pub fn position_of(&self, task: &Arc<Task>) -> Option<(usize, u8)> {
        for which in 0..2 {
            if let Some(priority) = self.queues[which].position_of(task) {
                return Some((which, priority));
            }
        }
        None
    }

    /// Direct access to one of the two queues by index.
    pub fn queue_mut(&mut self, which: usize) -> &mut PrioQueue {
        &mut self.queues[which]
    }
}

impl Default for RunQueues {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    fn noop(_: usize) {}

    fn mktask(delta: i8) -> Arc<Task> {
        crate::test_support::install_frames();
        Task::new_kernel("qtest", noop, 0, delta).unwrap()
    }

    #[test]
    fn pops_best_priority_first() {
        let mut q = PrioQueue::new();
        let worse = mktask(8);
        let better = mktask(-8);
        let wp = worse.priority();
        let bp = better.priority();
        q.push(wp, worse);
        q.push(bp, better);
        let (first_prio, first) = q.pop().unwrap();
        assert_eq!(first_prio, bp);
        assert_eq!(first.priority(), bp);
        let (second_prio, _) = q.pop().unwrap();
        assert_eq!(second_prio, wp);
        assert!(q.pop().is_none());
    }

    #[test]
    fn last_min_recovers_after_better_push() {
        let mut q = PrioQueue::new();
        let low = mktask(10);
        q.push(low.priority(), low);
        let _ = q.pop().unwrap();
        // last_min advanced; pushing a better task must rewind it.
        let high = mktask(-10);
        let hp = high.priority();
        q.push(hp, high);
        assert_eq!(q.pop().unwrap().0, hp);
    }

    #[test]
    fn fifo_within_one_priority() {
        let mut q = PrioQueue::new();
        let a = mktask(0);
        let b = mktask(0);
        let a_ptr = Arc::as_ptr(&a);
        q.push(a.priority(), a);
        q.push(16, b);
        let (_, first) = q.pop().unwrap();
        assert_eq!(Arc::as_ptr(&first), a_ptr);
    }

    #[test]
    fn remove_unlinks_queued_task() {
        let mut q = PrioQueue::new();
        let a = mktask(0);
        let keep = a.clone();
        q.push(16, a);
        let back = unsafe { q.remove(16, &keep) };
        assert!(q.is_empty());
        assert_eq!(Arc::as_ptr(&back), Arc::as_ptr(&keep));
    }

    #[test]
    fn run_queues_swap_on_drain() {
        let mut rq = RunQueues::new();
        let a = mktask(0);
        rq.expired().push(16, a);
        assert_eq!(rq.active().len(), 0);
        // Active is empty: pop_next swaps and finds the expired task.
        let popped = rq.pop_next();
        assert!(popped.is_some());
        assert_eq!(rq.total_len(), 0);
        assert!(rq.pop_next().is_none());
    }
}
