//! # Pluggable execution contexts.
//!
//! A [`Scheduler`] names a pool of [`Worker`]s. A worker is a single lane:
//! tasks submitted to it run in FIFO order and never overlap. Different
//! workers may run in parallel.
//!
//! ```text
//! Scheduler ──create_worker()──► Worker ──schedule(task)──► Lane (FIFO) ──► task()
//!     │                             │
//!     │                             └─ dispose(): cancels queued/delayed tasks of this worker
//!     └─ dispose(): cancels every worker, releases threads
//! ```
//!
//! ## Implementations
//! | Scheduler | Workers | Delays | Dispose |
//! |---|---|---|---|
//! | [`ImmediateScheduler`] | none, runs inline | rejected | no-op |
//! | single | 1 lane | yes | queued tasks dropped |
//! | parallel | one lane per core, round-robin | yes | queued tasks dropped |
//! | bounded-elastic | lanes created on demand up to a cap | yes | queued tasks dropped |
//! | [`VirtualTimeScheduler`] | inline on the driving thread | yes (virtual) | queued tasks dropped |
//!
//! ## Rules
//! - A task already running when its worker or scheduler is disposed finishes.
//! - A worker lease is held by every pending task leased through
//!   [`Scheduler::schedule`] and released on every exit path, including
//!   cancellation and panics.
//! - Panics inside tasks are caught and logged; the lane keeps running.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::context::{keys, Context};
use crate::error::FluxError;

mod immediate;
mod lane;
mod pool;
mod virtual_time;

pub use immediate::ImmediateScheduler;
pub use pool::{PoolScheduler, Schedulers};
pub use virtual_time::VirtualTimeScheduler;

pub(crate) use pool::is_non_blocking_thread;

/// Unit of work submitted to a scheduler.
pub type Runnable = Box<dyn FnOnce() + Send + 'static>;

/// Shared scheduler handle.
pub type SchedulerRef = Arc<dyn Scheduler>;

/// Pluggable execution context.
pub trait Scheduler: Send + Sync + 'static {
    /// Scheduler name used in logs, thread names and errors.
    fn name(&self) -> &str;

    /// Leases a worker. Workers of a disposed scheduler reject every task.
    fn create_worker(&self) -> Worker;

    /// Current time of this scheduler (virtual for test schedulers).
    fn now(&self) -> Duration {
        wall_clock()
    }

    /// Cancels pending tasks and releases resources.
    fn dispose(&self);

    /// True once [`dispose`](Self::dispose) was called.
    fn is_disposed(&self) -> bool;

    /// Runs `task` on a freshly leased worker; the lease lives as long as the task.
    fn schedule(&self, task: Runnable) -> Result<TaskHandle, FluxError> {
        let worker = self.create_worker();
        let lease = worker.clone();
        worker.schedule(move || {
            let _lease = lease;
            task();
        })
    }

    /// Runs `task` after `delay` on a freshly leased worker.
    fn schedule_after(&self, delay: Duration, task: Runnable) -> Result<TaskHandle, FluxError> {
        let worker = self.create_worker();
        let lease = worker.clone();
        worker.schedule_after(delay, move || {
            let _lease = lease;
            task();
        })
    }
}

fn wall_clock() -> Duration {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed()
}

/// Returns the scheduler timed operators use for `cx`: the virtual clock
/// installed by the test harness, or the shared parallel scheduler.
pub(crate) fn timer_for(cx: &Context) -> SchedulerRef {
    match cx.get_reserved::<VirtualTimeScheduler>(keys::VIRTUAL_TIME) {
        Some(vts) => Arc::new(vts.clone()),
        None => Schedulers::parallel(),
    }
}

/// Handle to a submitted task; cancelling it prevents the task from starting.
#[derive(Clone, Debug)]
pub struct TaskHandle {
    token: CancellationToken,
}

impl TaskHandle {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Prevents the task from running if it has not started yet.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// True once cancelled (directly or through worker/scheduler disposal).
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A queued task with its cancellation token.
pub(crate) struct Job {
    task: Runnable,
    token: CancellationToken,
}

impl Job {
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Runs the task unless cancelled; panics are contained.
    pub(crate) fn run(self) {
        if self.token.is_cancelled() {
            return;
        }
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(self.task)) {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            tracing::error!(panic = %message, "scheduled task panicked");
        }
    }
}

/// Execution lane behind a worker.
pub(crate) trait Lane: Send + Sync + 'static {
    /// Enqueues `job`; the error is the rejection reason.
    fn submit(&self, job: Job) -> Result<(), &'static str>;

    /// Enqueues `job` once `delay` has elapsed.
    fn submit_after(&self, delay: Duration, job: Job) -> Result<(), &'static str>;
}

/// Decrements a lane's lease counter when dropped.
pub(crate) struct LeaseGuard {
    leases: Arc<AtomicUsize>,
}

impl LeaseGuard {
    pub(crate) fn acquire(leases: &Arc<AtomicUsize>) -> Self {
        leases.fetch_add(1, Ordering::AcqRel);
        Self {
            leases: Arc::clone(leases),
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.leases.fetch_sub(1, Ordering::AcqRel);
    }
}

struct WorkerInner {
    scheduler: Arc<str>,
    lane: Arc<dyn Lane>,
    token: CancellationToken,
    _lease: Option<LeaseGuard>,
}

/// Leased, disposable execution lane.
///
/// Cloning shares the lease. Dropping the last clone releases the lease but
/// does not cancel pending tasks; [`dispose`](Self::dispose) does.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    pub(crate) fn new(
        scheduler: Arc<str>,
        lane: Arc<dyn Lane>,
        parent: &CancellationToken,
        lease: Option<LeaseGuard>,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                scheduler,
                lane,
                token: parent.child_token(),
                _lease: lease,
            }),
        }
    }

    /// Submits `task` for FIFO execution on this worker.
    pub fn schedule(&self, task: impl FnOnce() + Send + 'static) -> Result<TaskHandle, FluxError> {
        let job = self.job(Box::new(task))?;
        let handle = TaskHandle::new(job.token.clone());
        self.inner
            .lane
            .submit(job)
            .map_err(|reason| self.rejected(reason))?;
        Ok(handle)
    }

    /// Submits `task` to run on this worker after `delay`.
    pub fn schedule_after(
        &self,
        delay: Duration,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<TaskHandle, FluxError> {
        let job = self.job(Box::new(task))?;
        let handle = TaskHandle::new(job.token.clone());
        self.inner
            .lane
            .submit_after(delay, job)
            .map_err(|reason| self.rejected(reason))?;
        Ok(handle)
    }

    /// Cancels all tasks of this worker that have not started yet.
    pub fn dispose(&self) {
        self.inner.token.cancel();
    }

    /// True once disposed, directly or through the scheduler.
    pub fn is_disposed(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    fn job(&self, task: Runnable) -> Result<Job, FluxError> {
        if self.is_disposed() {
            return Err(self.rejected("worker disposed"));
        }
        Ok(Job {
            task,
            token: self.inner.token.child_token(),
        })
    }

    fn rejected(&self, reason: &'static str) -> FluxError {
        FluxError::Rejected {
            scheduler: Arc::clone(&self.inner.scheduler),
            reason,
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("scheduler", &self.inner.scheduler)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
