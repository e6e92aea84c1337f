//! Bounded worker thread pool.
//!
//! One shared task queue, a busy counter, and an all-idle condvar for the
//! barrier wait. Used from the update and graphics paths only; the audio
//! path must never enqueue work here and wait on it.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use log::warn;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Queue capacity. `execute` blocks when full, which is acceptable on the
/// non-real-time paths that use the pool.
const TASK_QUEUE_CAPACITY: usize = 1024;

struct PoolState {
    /// Tasks enqueued but not yet finished.
    outstanding: Mutex<usize>,
    all_idle: Condvar,
}

pub struct ThreadPool {
    tx: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
    state: Arc<PoolState>,
}

impl ThreadPool {
    pub fn new(workers: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded::<Task>(TASK_QUEUE_CAPACITY);
        let state = Arc::new(PoolState {
            outstanding: Mutex::new(0),
            all_idle: Condvar::new(),
        });

        let handles = (0..workers.max(1))
            .map(|i| {
                let rx: Receiver<Task> = rx.clone();
                let state = state.clone();
                thread::Builder::new()
                    .name(format!("pool-worker-{}", i))
                    .spawn(move || worker_loop(rx, state))
                    .expect("failed to spawn pool worker")
            })
            .collect();

        Self {
            tx: Some(tx),
            workers: handles,
            state,
        }
    }

    /// Enqueue a task. Blocks if the queue is full.
    pub fn execute(&self, f: impl FnOnce() + Send + 'static) {
        {
            let mut outstanding = self.state.outstanding.lock().unwrap();
            *outstanding += 1;
        }
        if let Some(tx) = &self.tx {
            if tx.send(Box::new(f)).is_err() {
                warn!("thread pool queue closed, task dropped");
                let mut outstanding = self.state.outstanding.lock().unwrap();
                *outstanding -= 1;
            }
        }
    }

    /// Block until every previously enqueued task has completed.
    pub fn wait_finished(&self) {
        let mut outstanding = self.state.outstanding.lock().unwrap();
        while *outstanding > 0 {
            outstanding = self.state.all_idle.wait(outstanding).unwrap();
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Closing the channel stops the workers after the queue drains.
        self.tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(rx: Receiver<Task>, state: Arc<PoolState>) {
    while let Ok(task) = rx.recv() {
        task();
        let mut outstanding = state.outstanding.lock().unwrap();
        *outstanding -= 1;
        if *outstanding == 0 {
            state.all_idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn wait_finished_is_a_barrier() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait_finished();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn wait_finished_on_idle_pool_returns() {
        let pool = ThreadPool::new(2);
        pool.wait_finished();
    }

    #[test]
    fn drop_joins_workers() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(2);
            for _ in 0..10 {
                let counter = counter.clone();
                pool.execute(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        // Drop drains the queue before joining.
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }
}
