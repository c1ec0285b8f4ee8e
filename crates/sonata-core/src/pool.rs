// src/pool.rs
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::error::{SonataError, SonataResult};

/// A submission refused because the queue is full. Carries the task back so
/// the caller can retry it later.
#[derive(Debug, PartialEq, Eq)]
pub struct Rejected<T>(pub T);

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    available: Condvar,
    stop: AtomicBool,
    max_queue: usize,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed set of long-lived threads draining a bounded FIFO.
///
/// Each task is popped by exactly one worker, and the handler always runs
/// outside the queue lock.
pub struct WorkerPool<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    handles: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new<F>(workers: usize, max_queue: usize, handler: F) -> SonataResult<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        if workers == 0 || max_queue == 0 {
            return Err(SonataError::Pool(
                "worker count and queue capacity must be positive".into(),
            ));
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(max_queue.min(1024))),
            available: Condvar::new(),
            stop: AtomicBool::new(false),
            max_queue,
        });
        let handler = Arc::new(handler);

        let mut pool = Self {
            shared,
            handles: Vec::with_capacity(workers),
        };
        for i in 0..workers {
            let shared = pool.shared.clone();
            let handler = handler.clone();
            let handle = thread::Builder::new()
                .name(format!("sonata-worker-{}", i))
                .spawn(move || run_worker(i, &shared, &*handler))
                .map_err(|e| SonataError::Pool(format!("failed to spawn worker {}: {}", i, e)));
            match handle {
                Ok(handle) => pool.handles.push(handle),
                Err(e) => {
                    pool.shutdown();
                    return Err(e);
                }
            }
        }

        tracing::debug!(workers, max_queue, "worker pool started");
        Ok(pool)
    }

    /// Enqueue without blocking. Fails once `max_queue` tasks are waiting.
    pub fn submit(&self, task: T) -> Result<(), Rejected<T>> {
        {
            let mut queue = self.shared.lock();
            if queue.len() >= self.shared.max_queue || self.shared.stop.load(Ordering::Acquire) {
                return Err(Rejected(task));
            }
            queue.push_back(task);
        }
        self.shared.available.notify_one();
        Ok(())
    }

    /// Tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    /// Stop accepting work, wake idle workers and join them. Tasks already
    /// running finish; queued ones are dropped.
    pub fn shutdown(&mut self) {
        {
            let mut queue = self.shared.lock();
            self.shared.stop.store(true, Ordering::Release);
            queue.clear();
        }
        self.shared.available.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker<T, F>(id: usize, shared: &Shared<T>, handler: &F)
where
    F: Fn(T),
{
    loop {
        let task = {
            let mut queue = shared.lock();
            loop {
                if shared.stop.load(Ordering::Acquire) {
                    tracing::trace!(worker = id, "worker exiting");
                    return;
                }
                if let Some(task) = queue.pop_front() {
                    break task;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        #[cfg(feature = "catch-panic")]
        {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(task)));
            if result.is_err() {
                tracing::error!(worker = id, "task panicked");
            }
        }
        #[cfg(not(feature = "catch-panic"))]
        handler(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn runs_every_submitted_task() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = mpsc::channel();
        let c = counter.clone();
        let done_tx = Mutex::new(done_tx);
        let pool = WorkerPool::new(4, 100, move |n: usize| {
            c.fetch_add(n, Ordering::SeqCst);
            done_tx.lock().unwrap().send(()).unwrap();
        })
        .unwrap();

        for n in 1..=10 {
            pool.submit(n).unwrap();
        }
        for _ in 0..10 {
            done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 55);
    }

    #[test]
    fn rejects_when_full_and_recovers_after_drain() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let release_rx = Mutex::new(release_rx);

        let pool = WorkerPool::new(1, 2, move |n: u32| {
            started_tx.lock().unwrap().send(n).unwrap();
            release_rx.lock().unwrap().recv().unwrap();
        })
        .unwrap();

        // The single worker picks up the first task and blocks in it.
        pool.submit(1).unwrap();
        assert_eq!(started_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);

        pool.submit(2).unwrap();
        pool.submit(3).unwrap();
        assert_eq!(pool.queued(), 2);
        assert_eq!(pool.submit(4), Err(Rejected(4)));

        // Let the worker finish task 1 and pop task 2.
        release_tx.send(()).unwrap();
        assert_eq!(started_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        assert!(pool.submit(4).is_ok());

        for _ in 0..3 {
            release_tx.send(()).unwrap();
        }
    }

    #[cfg(feature = "catch-panic")]
    #[test]
    fn panicking_task_does_not_kill_worker() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let pool = WorkerPool::new(1, 10, move |n: u32| {
            if n == 0 {
                panic!("boom");
            }
            tx.lock().unwrap().send(n).unwrap();
        })
        .unwrap();

        pool.submit(0).unwrap();
        pool.submit(5).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 5);
    }

    #[test]
    fn shutdown_joins_workers_and_refuses_work() {
        let mut pool = WorkerPool::new(3, 10, |_: u8| {}).unwrap();
        assert_eq!(pool.workers(), 3);
        pool.shutdown();
        assert_eq!(pool.workers(), 0);
        assert_eq!(pool.submit(1), Err(Rejected(1)));
    }

    #[test]
    fn zero_sizes_are_rejected() {
        assert!(WorkerPool::new(0, 10, |_: u8| {}).is_err());
        assert!(WorkerPool::new(2, 0, |_: u8| {}).is_err());
    }
}
