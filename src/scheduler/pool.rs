//! # Thread-pool schedulers and the [`Schedulers`] factory.
//!
//! [`PoolScheduler`] owns a dedicated multi-thread tokio runtime and spreads
//! workers over [`TokioLane`]s:
//!
//! - **single**: one lane; every worker shares it.
//! - **parallel**: `n` lanes, workers assigned round-robin. Threads are
//!   flagged non-blocking; blocking adapters refuse to run on them.
//! - **bounded-elastic**: lanes created on demand up to a cap; a new worker
//!   takes the least-leased lane, or a fresh one while under the cap. Jobs run
//!   on the runtime's blocking pool.
//!
//! Shared instances (`Schedulers::single()`, `parallel()`,
//! `bounded_elastic()`) live for the whole process; `dispose` on them is a
//! no-op. Instances from `new_*` are owned by the caller and drop their
//! queued tasks on `dispose` or drop.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio_util::sync::CancellationToken;

use super::immediate::ImmediateScheduler;
use super::lane::TokioLane;
use super::{LeaseGuard, Scheduler, SchedulerRef, Worker};
use crate::config::Config;
use crate::error::AssemblyError;

thread_local! {
    static NON_BLOCKING: Cell<bool> = const { Cell::new(false) };
}

/// True when the current thread belongs to a single or parallel scheduler.
pub(crate) fn is_non_blocking_thread() -> bool {
    NON_BLOCKING.with(Cell::get)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolKind {
    Single,
    Parallel,
    BoundedElastic,
}

struct LaneSlot {
    lane: Arc<TokioLane>,
    leases: Arc<AtomicUsize>,
}

/// Scheduler backed by a dedicated tokio runtime.
pub struct PoolScheduler {
    name: Arc<str>,
    kind: PoolKind,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    shutdown: CancellationToken,
    lanes: Mutex<Vec<LaneSlot>>,
    capacity: usize,
    next: AtomicUsize,
    shared: bool,
}

impl PoolScheduler {
    fn build(name: &str, kind: PoolKind, capacity: usize, shared: bool) -> Result<Self, AssemblyError> {
        let capacity = AssemblyError::positive("capacity", capacity)?;
        let non_blocking = kind != PoolKind::BoundedElastic;
        let threads = match kind {
            PoolKind::Single => 1,
            PoolKind::Parallel => capacity,
            PoolKind::BoundedElastic => 1,
        };

        let mut builder = Builder::new_multi_thread();
        builder
            .worker_threads(threads)
            .max_blocking_threads(capacity)
            .thread_name(format!("{name}-worker"))
            .enable_time()
            .on_thread_start(move || {
                if non_blocking {
                    NON_BLOCKING.with(|flag| flag.set(true));
                }
            });
        let runtime = builder.build().map_err(|source| AssemblyError::Runtime {
            name: name.to_string(),
            source,
        })?;

        let handle = runtime.handle().clone();
        let shutdown = CancellationToken::new();
        let lanes = match kind {
            PoolKind::Single => vec![Self::slot(&handle, &shutdown, false)],
            PoolKind::Parallel => (0..capacity)
                .map(|_| Self::slot(&handle, &shutdown, false))
                .collect(),
            PoolKind::BoundedElastic => Vec::new(),
        };

        tracing::debug!(scheduler = name, kind = ?kind, capacity, "scheduler created");
        Ok(Self {
            name: Arc::from(name),
            kind,
            runtime: Mutex::new(Some(runtime)),
            handle,
            shutdown,
            lanes: Mutex::new(lanes),
            capacity,
            next: AtomicUsize::new(0),
            shared,
        })
    }

    fn slot(handle: &Handle, shutdown: &CancellationToken, blocking: bool) -> LaneSlot {
        LaneSlot {
            lane: Arc::new(TokioLane::spawn(handle, shutdown.clone(), blocking)),
            leases: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of lanes created so far.
    pub fn lane_count(&self) -> usize {
        self.lanes.lock().len()
    }

    /// Number of workers currently leased, across all lanes.
    pub fn active_leases(&self) -> usize {
        self.lanes
            .lock()
            .iter()
            .map(|s| s.leases.load(Ordering::Acquire))
            .sum()
    }

    fn pick_lane(&self) -> (Arc<TokioLane>, Arc<AtomicUsize>) {
        let mut lanes = self.lanes.lock();
        let least = lanes
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.leases.load(Ordering::Acquire))
            .map(|(i, s)| (i, s.leases.load(Ordering::Acquire)));

        let index = match (self.kind, least) {
            (PoolKind::BoundedElastic, Some((i, 0))) => i,
            (PoolKind::BoundedElastic, least) if lanes.len() < self.capacity || least.is_none() => {
                lanes.push(Self::slot(&self.handle, &self.shutdown, true));
                tracing::debug!(scheduler = %self.name, lanes = lanes.len(), "lane added");
                lanes.len() - 1
            }
            (PoolKind::BoundedElastic, Some((i, _))) => i,
            _ => self.next.fetch_add(1, Ordering::Relaxed) % lanes.len().max(1),
        };
        let slot = &lanes[index];
        (Arc::clone(&slot.lane), Arc::clone(&slot.leases))
    }

    fn shutdown_runtime(&self) {
        self.shutdown.cancel();
        if let Some(rt) = self.runtime.lock().take() {
            rt.shutdown_background();
            tracing::debug!(scheduler = %self.name, "scheduler disposed");
        }
    }
}

impl Scheduler for PoolScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_worker(&self) -> Worker {
        let (lane, leases) = self.pick_lane();
        let lease = LeaseGuard::acquire(&leases);
        Worker::new(Arc::clone(&self.name), lane, &self.shutdown, Some(lease))
    }

    fn dispose(&self) {
        if self.shared {
            tracing::debug!(scheduler = %self.name, "dispose ignored on shared scheduler");
            return;
        }
        self.shutdown_runtime();
    }

    fn is_disposed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for PoolScheduler {
    fn drop(&mut self) {
        self.shutdown_runtime();
    }
}

/// Factory for the built-in schedulers.
///
/// ```
/// use rivulet::{Scheduler, Schedulers};
///
/// let pool = Schedulers::new_parallel("workers", 2).unwrap();
/// assert_eq!(pool.name(), "workers");
/// pool.dispose();
/// assert!(pool.is_disposed());
/// ```
pub struct Schedulers;

impl Schedulers {
    /// Inline scheduler; shared.
    pub fn immediate() -> SchedulerRef {
        static SHARED: OnceLock<SchedulerRef> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(ImmediateScheduler::new())))
    }

    /// Shared single-lane scheduler.
    pub fn single() -> SchedulerRef {
        static SHARED: OnceLock<SchedulerRef> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| shared_or_immediate(PoolKind::Single, "single", 1)))
    }

    /// Shared parallel scheduler with one lane per core.
    pub fn parallel() -> SchedulerRef {
        static SHARED: OnceLock<SchedulerRef> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| {
            let n = Config::default().parallelism_resolved();
            shared_or_immediate(PoolKind::Parallel, "parallel", n)
        }))
    }

    /// Shared bounded-elastic scheduler capped at 10 × cores lanes.
    pub fn bounded_elastic() -> SchedulerRef {
        static SHARED: OnceLock<SchedulerRef> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| {
            let cap = Config::default().bounded_elastic_cap_resolved();
            shared_or_immediate(PoolKind::BoundedElastic, "bounded-elastic", cap)
        }))
    }

    /// Creates an owned single-lane scheduler.
    pub fn new_single(name: &str) -> Result<Arc<PoolScheduler>, AssemblyError> {
        PoolScheduler::build(name, PoolKind::Single, 1, false).map(Arc::new)
    }

    /// Creates an owned parallel scheduler with `parallelism` lanes.
    pub fn new_parallel(name: &str, parallelism: usize) -> Result<Arc<PoolScheduler>, AssemblyError> {
        PoolScheduler::build(name, PoolKind::Parallel, parallelism, false).map(Arc::new)
    }

    /// Creates an owned bounded-elastic scheduler with at most `cap` lanes.
    pub fn new_bounded_elastic(name: &str, cap: usize) -> Result<Arc<PoolScheduler>, AssemblyError> {
        PoolScheduler::build(name, PoolKind::BoundedElastic, cap, false).map(Arc::new)
    }

    /// Creates owned parallel and bounded-elastic schedulers sized by `config`.
    pub fn from_config(
        config: &Config,
    ) -> Result<(Arc<PoolScheduler>, Arc<PoolScheduler>), AssemblyError> {
        let parallel = Self::new_parallel("parallel", config.parallelism_resolved())?;
        let elastic = Self::new_bounded_elastic("bounded-elastic", config.bounded_elastic_cap_resolved())?;
        Ok((parallel, elastic))
    }
}

fn shared_or_immediate(kind: PoolKind, name: &str, capacity: usize) -> SchedulerRef {
    match PoolScheduler::build(name, kind, capacity, true) {
        Ok(pool) => Arc::new(pool),
        Err(e) => {
            tracing::error!(error = %e, scheduler = name, "falling back to immediate scheduler");
            Schedulers::immediate()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_single_lane_is_fifo() {
        let sched = Schedulers::new_single("fifo").unwrap();
        let (tx, rx) = mpsc::channel();
        let worker = sched.create_worker();
        for i in 0..100 {
            let tx = tx.clone();
            worker.schedule(move || tx.send(i).unwrap()).unwrap();
        }
        let got: Vec<i32> = (0..100)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(got, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_delayed_task_runs_later() {
        let sched = Schedulers::new_parallel("delay", 2).unwrap();
        let (tx, rx) = mpsc::channel();
        sched
            .schedule_after(Duration::from_millis(20), Box::new(move || tx.send(()).unwrap()))
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_dispose_drops_pending_tasks() {
        let sched = Schedulers::new_single("dispose").unwrap();
        let (tx, rx) = mpsc::channel::<()>();
        sched
            .schedule_after(Duration::from_secs(60), Box::new(move || tx.send(()).unwrap()))
            .unwrap();
        sched.dispose();
        assert!(sched.is_disposed());
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_err());
        assert!(sched.create_worker().schedule(|| {}).is_err());
    }

    #[test]
    fn test_parallel_threads_are_non_blocking() {
        let sched = Schedulers::new_parallel("flag", 1).unwrap();
        let (tx, rx) = mpsc::channel();
        sched
            .schedule(Box::new(move || tx.send(is_non_blocking_thread()).unwrap()))
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).ok(), Some(true));
        assert!(!is_non_blocking_thread());
    }

    #[test]
    fn test_bounded_elastic_grows_up_to_cap() {
        let sched = Schedulers::new_bounded_elastic("elastic", 2).unwrap();
        let a = sched.create_worker();
        let b = sched.create_worker();
        let c = sched.create_worker();
        assert_eq!(sched.lane_count(), 2);
        assert_eq!(sched.active_leases(), 3);
        drop((a, b, c));
        assert_eq!(sched.active_leases(), 0);
    }

    #[test]
    fn test_zero_parallelism_is_rejected() {
        assert!(Schedulers::new_parallel("zero", 0).is_err());
    }
}
