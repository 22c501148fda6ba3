//! Time-ordered task list.
//!
//! Tasks are addressed by [`TaskHandle`]s instead of callback identity. A handle
//! names exactly one task for its whole life, so rescheduling can only ever move
//! that task's due time; it never creates a second one.
//!
//! Cancellation does not remove anything: the task is marked dead and its
//! callback dropped, and the dead entry is purged on the next processing pass.

use std::collections::HashMap;
use std::time::Duration;

use super::Reactor;
use crate::error::Result;

/// Callback run by the reactor when a task becomes due.
pub type TaskFn = Box<dyn FnMut(&mut Reactor) -> Result<()>>;

/// Opaque handle returned by the scheduler, used to reschedule or cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

struct Task {
    due: Duration,
    seq: u64,
    interval: Duration,
    periodic: bool,
    callback: Option<TaskFn>,
    dead: bool,
    running: bool,
    rearmed: bool,
}

/// Pending buffer plus active list of tasks.
#[derive(Default)]
pub(crate) struct TaskQueue {
    next_id: u64,
    next_seq: u64,
    tasks: HashMap<u64, Task>,
    pending: Vec<u64>,
    active: Vec<u64>,
}

impl TaskQueue {
    pub(crate) fn insert(
        &mut self,
        now: Duration,
        delay: Duration,
        periodic: bool,
        callback: TaskFn,
    ) -> TaskHandle {
        let id = self.next_id;
        self.next_id += 1;
        let seq = self.bump_seq();

        self.tasks.insert(
            id,
            Task {
                due: now + delay,
                seq,
                interval: delay,
                periodic,
                callback: Some(callback),
                dead: false,
                running: false,
                rearmed: false,
            },
        );
        self.pending.push(id);
        TaskHandle(id)
    }

    /// Move a live task to `now + delay`. Returns false for unknown or dead handles.
    pub(crate) fn reschedule(
        &mut self,
        handle: TaskHandle,
        now: Duration,
        delay: Duration,
    ) -> bool {
        let seq = self.bump_seq();
        match self.tasks.get_mut(&handle.0) {
            Some(task) if !task.dead => {
                task.due = now + delay;
                task.seq = seq;
                if task.running {
                    task.rearmed = true;
                }
                true
            },
            _ => false,
        }
    }

    pub(crate) fn cancel(&mut self, handle: TaskHandle) -> bool {
        match self.tasks.get_mut(&handle.0) {
            Some(task) if !task.dead => {
                task.dead = true;
                task.callback = None;
                true
            },
            _ => false,
        }
    }

    /// Promote pending tasks to the active list, dropping those cancelled while pending.
    pub(crate) fn promote(&mut self) {
        for id in std::mem::take(&mut self.pending) {
            match self.tasks.get(&id) {
                Some(task) if !task.dead => self.active.push(id),
                Some(_) => {
                    self.tasks.remove(&id);
                },
                None => {},
            }
        }
    }

    /// Purge dead entries, sort by (due, seq) and return the tasks due at `now`.
    pub(crate) fn due(&mut self, now: Duration) -> Vec<TaskHandle> {
        let tasks = &mut self.tasks;
        self.active.retain(|id| match tasks.get(id) {
            Some(task) if task.dead && !task.running => {
                tasks.remove(id);
                false
            },
            Some(_) => true,
            None => false,
        });

        self.active
            .sort_by_key(|id| self.tasks.get(id).map(|t| (t.due, t.seq)));

        self.active
            .iter()
            .take_while(|id| self.tasks.get(id).is_some_and(|t| t.due <= now))
            .map(|id| TaskHandle(*id))
            .collect()
    }

    /// Take the callback of a task that is still live and still due.
    pub(crate) fn begin(&mut self, handle: TaskHandle, now: Duration) -> Option<TaskFn> {
        let task = self.tasks.get_mut(&handle.0)?;
        if task.dead || task.due > now {
            return None;
        }
        let callback = task.callback.take()?;
        task.running = true;
        task.rearmed = false;
        Some(callback)
    }

    /// Return the callback after invocation; decides whether the task stays.
    pub(crate) fn finish(&mut self, handle: TaskHandle, callback: TaskFn, now: Duration) {
        let seq = self.bump_seq();
        let Some(task) = self.tasks.get_mut(&handle.0) else {
            return;
        };
        task.running = false;

        if task.dead {
            self.tasks.remove(&handle.0);
        } else if task.periodic {
            if !task.rearmed {
                task.due = now + task.interval;
                task.seq = seq;
            }
            task.callback = Some(callback);
        } else if task.rearmed {
            task.callback = Some(callback);
        } else {
            self.tasks.remove(&handle.0);
        }
    }

    /// Earliest due time among live tasks, pending ones included.
    pub(crate) fn next_due(&self) -> Option<Duration> {
        self.tasks
            .values()
            .filter(|t| !t.dead)
            .map(|t| t.due)
            .min()
    }

    pub(crate) fn due_time(&self, handle: TaskHandle) -> Option<Duration> {
        self.tasks
            .get(&handle.0)
            .filter(|t| !t.dead)
            .map(|t| t.due)
    }

    /// Number of live tasks.
    pub(crate) fn len(&self) -> usize {
        self.tasks.values().filter(|t| !t.dead).count()
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}
