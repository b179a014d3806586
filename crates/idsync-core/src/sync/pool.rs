//! Bounded worker pool for senders and deferred reloads.
//!
//! Sizing follows the classic core/max/backlog discipline: below `min`
//! workers a new worker is started for each job; at or above it jobs queue
//! up to `backlog`; once the backlog is full extra workers are started up
//! to `max`; beyond that the job is handed back as rejected. Workers above
//! `min` exit after sitting idle for the keepalive period.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

const KEEPALIVE: Duration = Duration::from_secs(30);

struct PoolState {
    queue: VecDeque<Job>,
    workers: usize,
    active: usize,
    shutdown: bool,
    spawned: u64,
}

struct Shared {
    state: Mutex<PoolState>,
    /// Signalled when a job is queued or the pool shuts down
    work: Condvar,
    /// Signalled when a worker exits
    exited: Condvar,
    min: usize,
    max: usize,
    backlog: usize,
    keepalive: Duration,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(min: usize, max: usize, backlog: usize) -> Self {
        Self::with_keepalive(min, max, backlog, KEEPALIVE)
    }

    pub fn with_keepalive(min: usize, max: usize, backlog: usize, keepalive: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    workers: 0,
                    active: 0,
                    shutdown: false,
                    spawned: 0,
                }),
                work: Condvar::new(),
                exited: Condvar::new(),
                min,
                max: max.max(min),
                backlog,
                keepalive,
            }),
        }
    }

    /// Run `job` on the pool, or hand it back if the pool is saturated or
    /// shut down.
    pub fn try_execute(&self, job: Job) -> Result<(), Job> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(job);
        }

        let start_worker = if state.workers < self.shared.min {
            true
        } else if state.queue.len() < self.shared.backlog {
            false
        } else if state.workers < self.shared.max {
            true
        } else {
            return Err(job);
        };

        state.queue.push_back(job);
        if !start_worker {
            self.shared.work.notify_one();
            return Ok(());
        }

        // The new worker cannot take the job before the lock is released
        let id = state.spawned;
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("idsync-worker-{}", id))
            .spawn(move || worker_loop(shared));
        match spawned {
            Ok(_) => {
                state.workers += 1;
                state.spawned += 1;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Could not start worker thread");
                match state.queue.pop_back() {
                    Some(job) => Err(job),
                    None => Ok(()),
                }
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.shared.state.lock().workers
    }

    pub fn active_count(&self) -> usize {
        self.shared.state.lock().active
    }

    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Stop accepting jobs, drop the queued ones and wait up to `timeout`
    /// for running jobs to finish.
    ///
    /// Returns false if some job was still running at the deadline; that
    /// job is abandoned and its worker exits once it returns.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let dropped: Vec<Job> = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.work.notify_all();
            state.queue.drain(..).collect()
        };
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "Dropped queued jobs");
        }
        drop(dropped);

        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.workers > 0 {
            if self.shared.exited.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        if state.workers > 0 {
            warn!(
                workers = state.workers,
                active = state.active,
                "Abandoning workers still running at shutdown"
            );
            return false;
        }
        true
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if !state.shutdown {
            state.shutdown = true;
            let dropped: Vec<Job> = state.queue.drain(..).collect();
            self.shared.work.notify_all();
            drop(state);
            drop(dropped);
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = state.queue.pop_front() {
                    state.active += 1;
                    break Some(job);
                }
                if state.shutdown {
                    break None;
                }
                if state.workers > shared.min {
                    let timed_out = shared.work.wait_for(&mut state, shared.keepalive).timed_out();
                    if timed_out && state.queue.is_empty() && state.workers > shared.min {
                        break None;
                    }
                } else {
                    shared.work.wait(&mut state);
                }
            }
        };

        let Some(job) = job else {
            let mut state = shared.state.lock();
            state.workers -= 1;
            shared.exited.notify_all();
            return;
        };

        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("Worker job panicked");
        }
        shared.state.lock().active -= 1;
    }
}
