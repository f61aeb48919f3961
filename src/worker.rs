//! A bounded job queue serviced by a small pool of OS threads.
//!
//! Jobs are the object-store writes submitted from the chunker and tree
//! engine. Bounding the queue keeps an eager directory walk from buffering
//! an entire backup's worth of compressed chunks in memory while disk
//! writes lag behind; capping the thread count keeps a wide, shallow tree
//! from spawning one thread per file.
//!
//! One mutex-guarded state struct and one condition variable cover both
//! directions of backpressure: producers block in [`submit`](WorkerPool::submit)
//! when the queue is full, and [`wait_quiescent`](WorkerPool::wait_quiescent)
//! blocks until every worker has exited and the queue is empty. A single
//! `notify_all` on every state transition keeps both predicates honest
//! without a second condvar.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use anyhow::Result;

/// Hard cap on pending jobs; `submit` blocks once the queue reaches this.
pub const MAX_JOBS: usize = 50;
/// Hard cap on concurrently running worker threads.
pub const MAX_THREADS: usize = 6;

type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

struct State {
    jobs: VecDeque<Job>,
    running: usize,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
    error: Mutex<Option<anyhow::Error>>,
}

/// A worker pool, constructed fresh for each snapshot operation and
/// drained before its caller writes the snapshot object.
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new() -> WorkerPool {
        WorkerPool {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    jobs: VecDeque::new(),
                    running: 0,
                }),
                cond: Condvar::new(),
                error: Mutex::new(None),
            }),
        }
    }

    /// Queues `job`, blocking if the queue is already at [`MAX_JOBS`].
    /// Spawns a new worker thread if fewer than [`MAX_THREADS`] are
    /// currently running.
    pub fn submit(&self, job: Job) {
        let mut state = self.shared.state.lock().unwrap();
        while state.jobs.len() >= MAX_JOBS {
            state = self.shared.cond.wait(state).unwrap();
        }

        state.jobs.push_back(job);
        let should_spawn = state.running < MAX_THREADS;
        if should_spawn {
            state.running += 1;
        }
        self.shared.cond.notify_all();
        drop(state);

        if should_spawn {
            let shared = Arc::clone(&self.shared);
            thread::Builder::new()
                .name("bkp-worker".into())
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn worker thread");
        }
    }

    /// Blocks until every worker has exited and the queue is empty, then
    /// returns the first job error seen, if any. A quiescent pool can be
    /// submitted to again; workers are respawned on demand.
    pub fn wait_quiescent(&self) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        while state.running > 0 || !state.jobs.is_empty() {
            state = self.shared.cond.wait(state).unwrap();
        }
        drop(state);

        match self.shared.error.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = shared.state.lock().unwrap();
            match state.jobs.pop_back() {
                Some(job) => {
                    shared.cond.notify_all();
                    job
                }
                None => {
                    state.running -= 1;
                    shared.cond.notify_all();
                    break;
                }
            }
        };

        if let Err(e) = job() {
            let mut slot = shared.error.lock().unwrap();
            if slot.is_none() {
                *slot = Some(e);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn all_jobs_run() {
        let pool = WorkerPool::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..200 {
            let counter = Arc::clone(&counter);
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }

        pool.wait_quiescent().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 200);
    }

    #[test]
    fn first_error_is_reported() {
        let pool = WorkerPool::new();
        pool.submit(Box::new(|| Ok(())));
        pool.submit(Box::new(|| anyhow::bail!("boom")));
        pool.submit(Box::new(|| Ok(())));

        let result = pool.wait_quiescent();
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().to_string(), "boom");
    }

    #[test]
    fn empty_pool_is_immediately_quiescent() {
        let pool = WorkerPool::new();
        pool.wait_quiescent().unwrap();
    }
}
