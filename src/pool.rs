//! # Worker Pools
//!
//! Every store operation runs on a dedicated OS thread that owns its SQLite
//! connections and warmed statement cache. This module provides the generic
//! pool those threads live in; [`crate::db`] instantiates six of them:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Async Facade (ChainDb)                    │
//! └───────┬───────────┬───────────┬───────────┬──────────┬──────────┘
//!         │           │           │           │          │
//!       core        bundles      data     moderation    gql / debug
//!      1R / 1W      1R / 1W    2R / 1W     1R / 1W     NR / —  1R / —
//! ```
//!
//! ## Scheduling Contract
//!
//! - Per pool+role there is one bounded FIFO queue. Same-role workers compete
//!   for the shared receiver and pull a job only when idle, so dispatch order
//!   is submission order. Completion order across parallel readers is not
//!   guaranteed.
//! - Writers serialize by construction: no pool has more than one writer.
//! - Submission is `try_send`: a full queue rejects with [`Error::QueueFull`]
//!   instead of buffering without bound behind a stalled writer.
//!
//! ## Failure Contract
//!
//! - A job that panics takes its reply channel down with it; the caller
//!   observes [`Error::WorkerDied`] and the thread rebuilds its worker state
//!   (fresh connections, fresh caches) before pulling the next job.
//! - A worker whose running error count exceeds
//!   [`MAX_WORKER_ERRORS`](crate::types::MAX_WORKER_ERRORS) is likewise torn
//!   down and rebuilt; the job that crossed the budget already received its
//!   error reply.
//! - Shutdown enqueues one `Terminate` envelope per worker and joins the
//!   threads; queued jobs ahead of the terminator still complete.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::types::MAX_WORKER_ERRORS;

// =============================================================================
// Worker Trait
// =============================================================================

/// Outcome of one handled job, fed into the worker's error budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// The job replied with an error. The worker stays up until the budget
    /// runs out.
    Errored,
}

/// A store worker: owns connections, handles one job at a time.
///
/// Implementations reply through the channel carried inside the job itself
/// and report the outcome for budget accounting.
pub trait PoolWorker: Send + 'static {
    type Job: Send + 'static;

    fn handle(&mut self, job: Self::Job) -> JobOutcome;
}

// =============================================================================
// Pool
// =============================================================================

enum Envelope<J> {
    Job(J),
    Terminate,
}

/// A fixed set of same-role workers behind one FIFO queue.
pub struct Pool<J> {
    name: &'static str,
    role: &'static str,
    tx: mpsc::Sender<Envelope<J>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl<J: Send + 'static> Pool<J> {
    /// Spawns `workers` threads, each building its own state via `factory`.
    ///
    /// The factory runs on the worker thread (SQLite connections are not
    /// `Sync`) and runs again whenever a worker is rebuilt after a panic or
    /// an exhausted error budget.
    pub fn spawn<W, F>(
        name: &'static str,
        role: &'static str,
        workers: usize,
        queue_depth: usize,
        factory: F,
    ) -> Result<Self>
    where
        W: PoolWorker<Job = J>,
        F: Fn() -> Result<W> + Send + Sync + Clone + 'static,
    {
        assert!(workers > 0, "a pool needs at least one worker");

        let (tx, rx) = mpsc::channel(queue_depth);
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let rx = Arc::clone(&rx);
            let factory = factory.clone();
            let handle = std::thread::Builder::new()
                .name(format!("chaindex-{name}-{role}-{i}"))
                .spawn(move || run_worker(name, role, rx, factory))
                .map_err(|e| Error::Schema(format!("failed to spawn {name} {role} worker: {e}")))?;
            handles.push(handle);
        }

        Ok(Self {
            name,
            role,
            tx,
            handles: Mutex::new(handles),
            worker_count: workers,
        })
    }

    /// Number of workers serving this queue.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Submits a job and awaits its reply.
    ///
    /// `make` receives the reply sender and builds the job carrying it; the
    /// round trip is one `oneshot` await. Fails fast with `QueueFull` when
    /// the queue is at capacity and `WorkerDied` when the worker drops the
    /// reply channel without answering.
    pub async fn submit<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> J,
    ) -> Result<R> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .try_send(Envelope::Job(make(reply_tx)))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => Error::QueueFull {
                    pool: self.name,
                    role: self.role,
                },
                mpsc::error::TrySendError::Closed(_) => Error::WorkerDied {
                    pool: self.name,
                    role: self.role,
                },
            })?;

        reply_rx.await.map_err(|_| Error::WorkerDied {
            pool: self.name,
            role: self.role,
        })
    }

    /// Enqueues a terminator per worker and joins the threads.
    ///
    /// Jobs already queued ahead of the terminators complete first.
    pub async fn shutdown(&self) {
        for _ in 0..self.worker_count {
            if self.tx.send(Envelope::Terminate).await.is_err() {
                break;
            }
        }
        let handles = {
            let mut guard = self.handles.lock().expect("pool handle mutex poisoned");
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            let _ = handle.join();
        }
        info!(pool = self.name, role = self.role, "pool shut down");
    }
}

// =============================================================================
// Worker Loop
// =============================================================================

/// Outer loop: (re)build worker state, run jobs until terminated or torn
/// down, repeat.
fn run_worker<W, F>(
    name: &'static str,
    role: &'static str,
    rx: Arc<Mutex<mpsc::Receiver<Envelope<W::Job>>>>,
    factory: F,
) where
    W: PoolWorker,
    F: Fn() -> Result<W>,
{
    loop {
        let mut worker = match factory() {
            Ok(w) => w,
            Err(e) => {
                warn!(pool = name, role, error = %e, "worker construction failed, retrying");
                std::thread::sleep(std::time::Duration::from_secs(1));
                continue;
            }
        };

        match run_jobs(name, role, &rx, &mut worker) {
            WorkerExit::Terminated => return,
            WorkerExit::Rebuild => continue,
        }
    }
}

enum WorkerExit {
    Terminated,
    Rebuild,
}

/// Inner loop: pull jobs in FIFO order until terminated, panicked, or over
/// the error budget.
fn run_jobs<W: PoolWorker>(
    name: &'static str,
    role: &'static str,
    rx: &Arc<Mutex<mpsc::Receiver<Envelope<W::Job>>>>,
    worker: &mut W,
) -> WorkerExit {
    let mut errors = 0usize;

    loop {
        // Hold the receiver lock only while pulling; handling runs unlocked
        // so sibling workers keep draining the queue.
        let envelope = {
            let mut guard = rx.lock().expect("pool receiver mutex poisoned");
            guard.blocking_recv()
        };

        let job = match envelope {
            None | Some(Envelope::Terminate) => return WorkerExit::Terminated,
            Some(Envelope::Job(job)) => job,
        };

        match catch_unwind(AssertUnwindSafe(|| worker.handle(job))) {
            Ok(JobOutcome::Completed) => {}
            Ok(JobOutcome::Errored) => {
                errors += 1;
                if errors > MAX_WORKER_ERRORS {
                    warn!(
                        pool = name,
                        role, errors, "worker exceeded its error budget, rebuilding"
                    );
                    return WorkerExit::Rebuild;
                }
            }
            Err(_) => {
                // The reply sender died inside the panicked closure; the
                // caller sees WorkerDied.
                warn!(pool = name, role, "worker panicked on a job, rebuilding");
                return WorkerExit::Rebuild;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
