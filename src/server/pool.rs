//! Fixed-size worker pool.
//!
//! Tasks are boxed closures pulled from one shared, unbounded FIFO queue.
//! A panicking task is caught and logged; the worker that ran it keeps going.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tokio::sync::oneshot;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The pool no longer accepts work.
    ShutDown,
    /// The task panicked before producing a result.
    Panicked,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::ShutDown => f.write_str("worker pool is shut down"),
            PoolError::Panicked => f.write_str("task panicked"),
        }
    }
}

impl std::error::Error for PoolError {}

struct Queue {
    jobs: VecDeque<Job>,
    active: usize,
    stop: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    /// Signalled when a job is queued or the pool stops.
    work: Condvar,
    /// Signalled when a worker finishes a job.
    idle: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Completion handle for a submitted task.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task has run.
    ///
    /// Must not be called from inside an async runtime.
    pub fn join(self) -> Result<T, PoolError> {
        self.rx.blocking_recv().map_err(|_| PoolError::Panicked)
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Spawns `size` workers (at least one).
    pub fn new(size: usize) -> io::Result<Self> {
        let size = size.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::new(),
                active: 0,
                stop: false,
            }),
            work: Condvar::new(),
            idle: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("sluice-worker-{i}"))
                .spawn(move || worker_loop(worker_shared));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shared.lock().stop = true;
                    shared.work.notify_all();
                    for worker in workers {
                        let _ = worker.join();
                    }
                    return Err(e);
                }
            }
        }

        tracing::debug!(workers = size, "Worker pool started");

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queues a task and wakes one idle worker.
    pub fn submit<F, T>(&self, task: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            // The receiver may already be gone; nobody is waiting then.
            let _ = tx.send(task());
        });

        {
            let mut queue = self.shared.lock();
            if queue.stop {
                tracing::error!("Attempt to submit a task to a stopped worker pool");
                return Err(PoolError::ShutDown);
            }
            queue.jobs.push_back(job);
        }
        self.shared.work.notify_one();

        Ok(TaskHandle { rx })
    }

    /// Blocks until the queue is empty and no worker is mid-task.
    pub fn drain(&self) {
        let mut queue = self.shared.lock();
        while !queue.jobs.is_empty() || queue.active > 0 {
            queue = self
                .shared
                .idle
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stops accepting work, lets workers finish what is already queued and
    /// joins them. Calling it again is a no-op.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.lock();
            if queue.stop {
                return;
            }
            queue.stop = true;
        }
        self.shared.work.notify_all();

        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!("Worker thread exited abnormally");
            }
        }
        tracing::debug!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut queue = shared.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    queue.active += 1;
                    break job;
                }
                if queue.stop {
                    return;
                }
                queue = shared
                    .work
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::error!("Task panicked; worker continues");
        }

        shared.lock().active -= 1;
        shared.idle.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn handle_returns_task_result() {
        let pool = WorkerPool::new(2).unwrap();
        let handle = pool.submit(|| 6 * 7).unwrap();
        assert_eq!(handle.join(), Ok(42));
    }

    #[test]
    fn panicking_task_reports_through_handle() {
        let pool = WorkerPool::new(1).unwrap();
        let handle = pool.submit(|| -> u32 { panic!("boom") }).unwrap();
        assert_eq!(handle.join(), Err(PoolError::Panicked));

        // Same single worker is still alive.
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        pool.submit(move || c.fetch_add(1, Ordering::SeqCst)).unwrap();
        pool.drain();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let pool = WorkerPool::new(2).unwrap();
        pool.shutdown();
        assert!(matches!(pool.submit(|| ()), Err(PoolError::ShutDown)));
    }
}
