use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::error::PoolError;

type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

// queue state and the shutdown flag live under the same lock
struct Queue<T> {
    tasks: VecDeque<T>,
    shutdown: bool,
}

struct Shared<T> {
    queue: Mutex<Queue<T>>,
    available: Condvar,
    handler: Handler<T>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Queue<T>> {
        // handlers never run under this lock, so a poisoned guard still holds a sane queue
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop(&self) {
        self.lock().shutdown = true;
        self.available.notify_all();
    }
}

/// Fixed set of worker threads draining a shared FIFO of tasks.
///
/// Every submitted task is handed to exactly one worker, which runs the pool's
/// handler on it outside the queue lock. The pool knows nothing about what a
/// task means.
pub struct ThreadPool<T> {
    shared: Arc<Shared<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl<T: Send + 'static> ThreadPool<T> {
    /// Starts `workers` threads. `queue_hint` pre-sizes the queue; submissions
    /// past it are still accepted.
    ///
    /// If any worker fails to start, the ones already running are stopped and
    /// joined before the error is returned.
    pub fn new<F>(workers: usize, queue_hint: usize, handler: F) -> Result<Self, PoolError>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        if workers == 0 {
            return Err(PoolError::BadParam("worker count must be positive"))
        }
        if queue_hint == 0 {
            return Err(PoolError::BadParam("queue capacity hint must be positive"))
        }

        let mut tasks = VecDeque::new();
        tasks.try_reserve(queue_hint).map_err(|_| PoolError::OutOfMemory)?;

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue { tasks, shutdown: false }),
            available: Condvar::new(),
            handler: Arc::new(handler),
        });

        let mut handles = Vec::with_capacity(workers);

        for id in 0..workers {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("pool-worker-{}", id))
                .spawn(move || worker_loop(id, &worker_shared));

            match spawned {
                Ok(h) => handles.push(h),
                Err(e) => {
                    error!("unable to start worker {}: {}", id, e);
                    // unwind the workers started so far
                    shared.stop();
                    for h in handles {
                        let _ = h.join();
                    }
                    return Err(PoolError::Spawn(e))
                }
            }
        }

        info!("thread pool started with {} workers, queue hint {}", workers, queue_hint);

        Ok(ThreadPool {
            shared,
            workers: Mutex::new(handles),
            size: workers,
        })
    }

    /// Queues a task at the tail and wakes one idle worker.
    pub fn submit(&self, task: T) -> Result<(), PoolError> {
        {
            let mut q = self.shared.lock();
            if q.shutdown {
                return Err(PoolError::ShutDown)
            }
            q.tasks.try_reserve(1).map_err(|_| PoolError::OutOfMemory)?;
            q.tasks.push_back(task);
        }

        self.shared.available.notify_one();
        Ok(())
    }
}

impl<T> ThreadPool<T> {
    /// Stops accepting tasks, lets the workers drain what is already queued,
    /// then joins them. Calling it again is a no-op.
    pub fn shutdown(&self) {
        let handles = {
            let mut w = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *w)
        };

        if handles.is_empty() {
            return
        }

        self.shared.stop();

        for h in handles {
            if h.join().is_err() {
                warn!("pool worker exited abnormally");
            }
        }

        info!("thread pool shut down");
    }

    #[cfg(test)]
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shared.lock().shutdown
    }

    pub fn size(&self) -> usize {
        self.size
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.shared.lock().tasks.len()
    }
}

impl<T> Drop for ThreadPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<T>(id: usize, shared: &Shared<T>) {
    loop {
        let task = {
            let mut q = shared.lock();
            loop {
                // queued work is drained before honoring shutdown
                if let Some(t) = q.tasks.pop_front() {
                    break t
                }
                if q.shutdown {
                    debug!("worker {} exiting", id);
                    return
                }
                q = shared.available.wait(q).unwrap_or_else(PoisonError::into_inner);
            }
        };

        let handler = &shared.handler;
        if panic::catch_unwind(AssertUnwindSafe(|| handler(task))).is_err() {
            error!("worker {} task panicked", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    type Job = Box<dyn FnOnce() + Send>;

    fn job_pool(workers: usize) -> ThreadPool<Job> {
        ThreadPool::new(workers, 10, |job: Job| job()).unwrap()
    }

    #[test]
    fn every_task_runs_exactly_once() {
        const TASKS: usize = 500;

        let counts: Arc<Vec<AtomicUsize>> = Arc::new((0..TASKS).map(|_| AtomicUsize::new(0)).collect());
        let pool = ThreadPool::new(4, 10, {
            let counts = Arc::clone(&counts);
            move |i: usize| {
                counts[i].fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        for i in 0..TASKS {
            pool.submit(i).unwrap();
        }
        pool.shutdown();

        assert!(counts.iter().all(|c| c.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn zero_workers_is_bad_param() {
        let r = ThreadPool::new(0, 10, |_: ()| {});
        assert!(matches!(r, Err(PoolError::BadParam(_))));

        let r = ThreadPool::new(2, 0, |_: ()| {});
        assert!(matches!(r, Err(PoolError::BadParam(_))));
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let pool = job_pool(2);
        pool.shutdown();

        assert!(pool.is_shutdown());
        assert!(matches!(pool.submit(Box::new(|| {})), Err(PoolError::ShutDown)));
    }

    #[test]
    fn shutdown_twice_is_noop() {
        let pool = job_pool(3);
        assert_eq!(pool.size(), 3);
        pool.shutdown();
        pool.shutdown();
    }

    #[test]
    fn queue_grows_past_hint() {
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let ran = Arc::new(AtomicUsize::new(0));
        let pool = job_pool(1);

        // park the only worker so later tasks pile up
        pool.submit(Box::new(move || {
            let _ = gate_rx.recv_timeout(Duration::from_secs(5));
        }))
        .unwrap();

        for _ in 0..50 {
            let ran = Arc::clone(&ran);
            pool.submit(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        assert!(pool.queued() >= 10);

        gate_tx.send(()).unwrap();
        pool.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn slow_handler_does_not_block_other_workers() {
        let (tx, rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<bool>();
        let pool = job_pool(2);

        // first task waits on the second one, which only works if the
        // handler runs outside the queue lock
        pool.submit(Box::new(move || {
            let got = rx.recv_timeout(Duration::from_secs(5)).is_ok();
            let _ = done_tx.send(got);
        }))
        .unwrap();
        pool.submit(Box::new(move || {
            let _ = tx.send(());
        }))
        .unwrap();

        assert!(done_rx.recv_timeout(Duration::from_secs(10)).unwrap());
        pool.shutdown();
    }

    #[test]
    fn panicking_task_keeps_worker_alive() {
        let ran = Arc::new(AtomicUsize::new(0));
        let pool = job_pool(1);

        pool.submit(Box::new(|| panic!("boom"))).unwrap();
        {
            let ran = Arc::clone(&ran);
            pool.submit(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.shutdown();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
