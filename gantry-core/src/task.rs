//! Cooperative task scheduler.
//!
//! A task is a unit of deferred work: it either sits in the timer wheel
//! waiting for its deadline, in the run queue waiting for its turn, or
//! idle waiting for an I/O or message wakeup. Handlers are not function
//! pointers: a task carries a [`TaskKind`] tag and the worker dispatches
//! on it, so all handler state stays inside the worker context.
//!
//! Within one scheduler iteration, tasks sharing a deadline run in
//! scheduling order, and run-queue order is strictly FIFO. Handlers run to
//! completion; there is no preemption.

use std::collections::VecDeque;

use crate::slots::{SlotId, Slots};
use crate::timer::{TimerKey, TimerWheel};

// ============================================================================
// Wake Reasons
// ============================================================================

/// Freshly created, first run.
pub const WAKE_INIT: u32 = 0x01;
/// Timer deadline reached.
pub const WAKE_TIMER: u32 = 0x02;
/// I/O activity on an owned file descriptor.
pub const WAKE_IO: u32 = 0x04;
/// Message from another task (queue promotion, admin order, shutdown).
pub const WAKE_MSG: u32 = 0x08;

// ============================================================================
// Task
// ============================================================================

/// Dispatch tag: what the worker should run when this task wakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Advance a session's state machine.
    Session(SlotId),
    /// Periodic frontend management (grace expiry, rate-limit resume).
    Proxy(usize),
    /// Service an admin applet connection.
    Admin(SlotId),
}

struct Task {
    kind: TaskKind,
    timer: Option<TimerKey>,
    queued: bool,
    wake: u32,
}

/// Handle to a scheduled task.
pub type TaskId = SlotId;

// ============================================================================
// Scheduler
// ============================================================================

/// Run queue plus timer wheel over a task arena.
pub struct Scheduler {
    tasks: Slots<Task>,
    run: VecDeque<TaskId>,
    timers: TimerWheel<TaskId>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: Slots::new(),
            run: VecDeque::new(),
            timers: TimerWheel::new(),
        }
    }

    /// Register a task. It does not run until woken or given a timer.
    pub fn create(&mut self, kind: TaskKind) -> TaskId {
        self.tasks.insert(Task {
            kind,
            timer: None,
            queued: false,
            wake: 0,
        })
    }

    /// Unregister a task, cancelling any pending timer.
    ///
    /// A queued entry is left in the run queue and skipped on pop thanks to
    /// the generational handle.
    pub fn remove(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.remove(id) {
            if let Some(key) = task.timer {
                self.timers.cancel(key);
            }
        }
    }

    /// Number of live tasks.
    #[inline]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Mark a task runnable for the given reason.
    pub fn wake(&mut self, id: TaskId, reason: u32) {
        if let Some(task) = self.tasks.get_mut(id) {
            task.wake |= reason;
            if !task.queued {
                task.queued = true;
                self.run.push_back(id);
            }
        }
    }

    /// Arm (or move) the task's wakeup timer to absolute millisecond `at`.
    pub fn set_timer(&mut self, id: TaskId, at: u64) {
        let old = match self.tasks.get_mut(id) {
            Some(task) => task.timer.take(),
            None => return,
        };
        if let Some(key) = old {
            if key.deadline() == at {
                // Unchanged deadline: keep position (FIFO stability).
                if let Some(task) = self.tasks.get_mut(id) {
                    task.timer = Some(key);
                }
                return;
            }
            self.timers.cancel(key);
        }
        let key = self.timers.schedule(at, id);
        if let Some(task) = self.tasks.get_mut(id) {
            task.timer = Some(key);
        }
    }

    /// Disarm the task's wakeup timer.
    pub fn clear_timer(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.get_mut(id) {
            if let Some(key) = task.timer.take() {
                self.timers.cancel(key);
            }
        }
    }

    /// True when the run queue holds work for this iteration.
    #[inline]
    pub fn has_runnable(&self) -> bool {
        !self.run.is_empty()
    }

    /// Milliseconds the poller may sleep: zero when work is queued,
    /// otherwise the distance to the nearest timer, capped by `max_ms`.
    pub fn timeout_ms(&self, now: u64, max_ms: u64) -> u64 {
        if !self.run.is_empty() {
            return 0;
        }
        match self.timers.next_expiry() {
            Some(at) if at <= now => 0,
            Some(at) => (at - now).min(max_ms),
            None => max_ms,
        }
    }

    /// Move every timer due at `now` to the run queue.
    pub fn expire(&mut self, now: u64) {
        while let Some((_, id)) = self.timers.pop_expired(now) {
            if let Some(task) = self.tasks.get_mut(id) {
                task.timer = None;
            }
            self.wake(id, WAKE_TIMER);
        }
    }

    /// Dequeue the next runnable task, returning its kind and wake reasons.
    pub fn pop(&mut self) -> Option<(TaskId, TaskKind, u32)> {
        while let Some(id) = self.run.pop_front() {
            if let Some(task) = self.tasks.get_mut(id) {
                task.queued = false;
                let wake = std::mem::take(&mut task.wake);
                return Some((id, task.kind, wake));
            }
            // Stale handle from a removed task: skip.
        }
        None
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_queues_once() {
        let mut sched = Scheduler::new();
        let t = sched.create(TaskKind::Proxy(0));
        sched.wake(t, WAKE_IO);
        sched.wake(t, WAKE_MSG);
        let (id, kind, wake) = sched.pop().unwrap();
        assert_eq!(id, t);
        assert_eq!(kind, TaskKind::Proxy(0));
        assert_eq!(wake, WAKE_IO | WAKE_MSG);
        assert!(sched.pop().is_none());
    }

    #[test]
    fn test_fifo_run_order() {
        let mut sched = Scheduler::new();
        let a = sched.create(TaskKind::Proxy(1));
        let b = sched.create(TaskKind::Proxy(2));
        sched.wake(a, WAKE_MSG);
        sched.wake(b, WAKE_MSG);
        assert_eq!(sched.pop().unwrap().0, a);
        assert_eq!(sched.pop().unwrap().0, b);
    }

    #[test]
    fn test_timer_expiry_wakes_in_order() {
        let mut sched = Scheduler::new();
        let a = sched.create(TaskKind::Proxy(1));
        let b = sched.create(TaskKind::Proxy(2));
        sched.set_timer(b, 100);
        sched.set_timer(a, 50);
        sched.expire(100);
        assert_eq!(sched.pop().unwrap().0, a);
        let (id, _, wake) = sched.pop().unwrap();
        assert_eq!(id, b);
        assert_eq!(wake, WAKE_TIMER);
    }

    #[test]
    fn test_timeout_ms() {
        let mut sched = Scheduler::new();
        assert_eq!(sched.timeout_ms(0, 1_000), 1_000);
        let t = sched.create(TaskKind::Proxy(0));
        sched.set_timer(t, 300);
        assert_eq!(sched.timeout_ms(0, 1_000), 300);
        assert_eq!(sched.timeout_ms(400, 1_000), 0);
        sched.wake(t, WAKE_MSG);
        assert_eq!(sched.timeout_ms(0, 1_000), 0);
    }

    #[test]
    fn test_removed_task_skipped() {
        let mut sched = Scheduler::new();
        let a = sched.create(TaskKind::Proxy(1));
        let b = sched.create(TaskKind::Proxy(2));
        sched.wake(a, WAKE_MSG);
        sched.wake(b, WAKE_MSG);
        sched.remove(a);
        assert_eq!(sched.pop().unwrap().0, b);
        assert!(sched.pop().is_none());
    }

    #[test]
    fn test_set_timer_rearms() {
        let mut sched = Scheduler::new();
        let t = sched.create(TaskKind::Proxy(0));
        sched.set_timer(t, 500);
        sched.set_timer(t, 200);
        assert_eq!(sched.timeout_ms(0, 10_000), 200);
        sched.clear_timer(t);
        assert_eq!(sched.timeout_ms(0, 10_000), 10_000);
    }
}
