//! Fork compatibility shim and the worker-thread pool it drains.
//!
//! A forked child inherits only the calling thread.  Worker threads owned by
//! the runtime host disappear in the child, possibly holding locks or half
//! way through a job.  [`fork_safely`] therefore stops the [`WorkerPool`]
//! first, warns if that threw work away, forks, and then yields once so the
//! runtime gets a scheduling round in the new process before the caller
//! continues.
//!
//! The pool belongs to whoever hosts the cooperative runtime and offloads
//! blocking work from it; neither the detector nor
//! `stallwatch_runtime::Supervisor` creates one.  That owner passes its pool
//! to [`fork_safely`] in place of calling `fork()` directly.
//!
//! Fork only from a current-thread runtime; a multi-threaded tokio runtime
//! keeps its own workers that this shim cannot stop.

use stallwatch_types::StallError;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, warn};

#[cfg(unix)]
pub use nix::unistd::ForkResult;

type Job = Box<dyn FnOnce() + Send + 'static>;

// ────────────────────────────────────────────────────────────────────────────
// WorkerPool
// ────────────────────────────────────────────────────────────────────────────

/// Small pool of background threads for blocking work that must not run on
/// the cooperative runtime.
pub struct WorkerPool {
    sender: Option<flume::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    in_flight: Arc<AtomicUsize>,
    killed: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Start `size` worker threads.
    pub fn new(size: usize) -> Result<Self, StallError> {
        if size == 0 {
            return Err(StallError::InvalidConfig(
                "worker pool needs at least one thread".to_string(),
            ));
        }
        let (sender, receiver) = flume::unbounded::<Job>();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let killed = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(size);
        for n in 0..size {
            let receiver = receiver.clone();
            let in_flight = in_flight.clone();
            let killed = killed.clone();
            let worker = std::thread::Builder::new()
                .name(format!("stallwatch-worker-{n}"))
                .spawn(move || worker_loop(&receiver, &in_flight, &killed))?;
            workers.push(worker);
        }
        Ok(Self {
            sender: Some(sender),
            workers,
            in_flight,
            killed,
        })
    }

    /// Queue `job` for execution on a worker thread.
    pub fn execute<F>(&self, job: F) -> Result<(), StallError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| StallError::Runtime("worker pool has been killed".to_string()))?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        sender.send(Box::new(job)).map_err(|_| {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            StallError::Runtime("worker pool is shut down".to_string())
        })
    }

    /// Jobs queued or running.
    pub fn len(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Worker threads not yet joined.
    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting work and discard everything still queued.  Jobs already
    /// running finish; there is no way to stop an OS thread mid-job.
    pub fn kill(&mut self) {
        self.killed.store(true, Ordering::SeqCst);
        self.sender = None;
    }

    /// Wait for every worker thread to exit.  Call [`kill`](Self::kill) first
    /// or this waits for the queue to drain.
    pub fn join(&mut self) {
        self.sender = None;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("worker thread panicked outside a job");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.kill();
        self.join();
    }
}

fn worker_loop(receiver: &flume::Receiver<Job>, in_flight: &AtomicUsize, killed: &AtomicBool) {
    while let Ok(job) = receiver.recv() {
        if !killed.load(Ordering::SeqCst) && catch_unwind(AssertUnwindSafe(job)).is_err() {
            warn!("worker job panicked");
        }
        in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Fork shim
// ────────────────────────────────────────────────────────────────────────────

/// Kill and join `pool` ahead of a fork.  Returns how many jobs were queued
/// or running when it was called.
pub fn prepare_for_fork(pool: &mut WorkerPool) -> usize {
    let active = pool.len();
    if active > 0 {
        warn!(
            active,
            "calling fork() while worker threads are active; they will be killed"
        );
    }
    pool.kill();
    pool.join();
    debug!(active, "worker pool drained before fork");
    active
}

/// Drain `pool`, fork the process, then yield once to the runtime.
///
/// Returns the [`ForkResult`] in both processes.
#[cfg(unix)]
pub async fn fork_safely(pool: &mut WorkerPool) -> Result<ForkResult, StallError> {
    prepare_for_fork(pool);
    // SAFETY: the worker pool has been joined, so apart from runtime-internal
    // threads the caller is responsible for, only this thread is running.
    let result = unsafe { nix::unistd::fork() }.map_err(|e| StallError::Fork(e.to_string()))?;
    tokio::task::yield_now().await;
    Ok(result)
}
