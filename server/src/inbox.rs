use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, error};

use crate::error::PoolError;
use crate::registry::ConnId;

// pending work for one connection, `scheduled` while a worker owns the drain
struct Inbox<T> {
    tasks: VecDeque<T>,
    scheduled: bool,
    closing: bool,
}

impl<T> Inbox<T> {
    fn new() -> Self {
        Inbox {
            tasks: VecDeque::new(),
            scheduled: false,
            closing: false,
        }
    }
}

/// Per-connection FIFOs sitting in front of the worker pool.
///
/// The pool is only handed a `ConnId`. At most one worker drains a given
/// connection at a time, so one connection's tasks run in the order they
/// arrived while different connections still run in parallel.
pub struct Inboxes<T> {
    inboxes: Mutex<HashMap<ConnId, Inbox<T>>>,
}

impl<T> Default for Inboxes<T> {
    fn default() -> Self {
        Inboxes {
            inboxes: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> Inboxes<T> {
    pub fn new() -> Self {
        Inboxes::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnId, Inbox<T>>> {
        // tasks never run under this lock
        self.inboxes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `task` behind earlier work for `id`. Returns true when no
    /// worker is draining `id` yet, in which case the caller must hand `id`
    /// to the pool.
    pub fn push(&self, id: ConnId, task: T) -> Result<bool, PoolError> {
        self.enqueue(id, task, false)
    }

    /// Same as `push` for the final task of a connection. The inbox is
    /// dropped once it has been drained.
    pub fn push_last(&self, id: ConnId, task: T) -> Result<bool, PoolError> {
        self.enqueue(id, task, true)
    }

    fn enqueue(&self, id: ConnId, task: T, last: bool) -> Result<bool, PoolError> {
        let mut inboxes = self.lock();
        inboxes.try_reserve(1).map_err(|_| PoolError::OutOfMemory)?;

        let inbox = inboxes.entry(id).or_insert_with(Inbox::new);
        inbox.tasks.try_reserve(1).map_err(|_| PoolError::OutOfMemory)?;
        inbox.tasks.push_back(task);
        inbox.closing |= last;

        let schedule = !inbox.scheduled;
        inbox.scheduled = true;
        Ok(schedule)
    }

    /// Runs every task queued for `id` in order until its inbox is empty.
    /// Called from a pool worker after `push` asked for scheduling.
    pub fn drain(&self, id: ConnId, mut run: impl FnMut(T)) {
        loop {
            let task = {
                let mut inboxes = self.lock();
                let Some(inbox) = inboxes.get_mut(&id) else { return };

                match inbox.tasks.pop_front() {
                    Some(task) => task,
                    None => {
                        inbox.scheduled = false;
                        let closing = inbox.closing;
                        if closing {
                            inboxes.remove(&id);
                            debug!("inbox of {} retired", id);
                        }
                        return
                    }
                }
            };

            // a panicking task must not leave the inbox marked as scheduled
            if panic::catch_unwind(AssertUnwindSafe(|| run(task))).is_err() {
                error!("task for {} panicked", id);
            }
        }
    }

    /// Forgets `id` along with anything still queued for it. Returns how many
    /// tasks were dropped.
    pub fn discard(&self, id: ConnId) -> usize {
        self.lock().remove(&id).map_or(0, |inbox| inbox.tasks.len())
    }

    /// Forgets every inbox. Returns how many tasks were dropped.
    pub fn clear(&self) -> usize {
        self.lock().drain().map(|(_, inbox)| inbox.tasks.len()).sum()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}
