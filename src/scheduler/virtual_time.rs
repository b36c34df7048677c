//! # Virtual clock.
//!
//! [`VirtualTimeScheduler`] never consults the wall clock. Tasks are kept in
//! a queue ordered by `(due, submission)` and run inline, on the thread that
//! advances time, once the clock reaches them.
//!
//! ```text
//! schedule_after(1h, t) ──► queue[(now+1h, seq)]
//! advance_time_by(1h)   ──► horizon = now+1h ─► run every task with due ≤ horizon, in order
//!                                            └► now = horizon
//! ```
//!
//! ## Rules
//! - Zero-delay tasks run immediately (the horizon is never behind `now`).
//! - While a task runs, `now()` equals its due time; tasks it schedules within
//!   the current horizon run in the same advance.
//! - `dispose` cancels every queued task.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{Job, Lane, Scheduler, Worker};
use crate::protocol::WorkInProgress;

struct ClockState {
    now: Duration,
    horizon: Duration,
    seq: u64,
    queue: BTreeMap<(Duration, u64), Job>,
}

struct Clock {
    state: Mutex<ClockState>,
    wip: WorkInProgress,
    root: CancellationToken,
    disposed: AtomicBool,
}

impl Clock {
    fn enqueue(&self, delay: Duration, job: Job) {
        {
            let mut st = self.state.lock();
            let due = st.now.saturating_add(delay);
            let seq = st.seq;
            st.seq += 1;
            st.queue.insert((due, seq), job);
        }
        self.drain();
    }

    fn drain(&self) {
        self.wip.drain(|| loop {
            let next = {
                let mut st = self.state.lock();
                let horizon = st.horizon;
                match st.queue.first_key_value() {
                    Some((&(due, _), _)) if due <= horizon => {
                        if due > st.now {
                            st.now = due;
                        }
                        st.queue.pop_first().map(|(_, job)| job)
                    }
                    _ => {
                        st.now = horizon;
                        None
                    }
                }
            };
            match next {
                Some(job) => job.run(),
                None => break,
            }
        });
    }
}

impl Lane for Clock {
    fn submit(&self, job: Job) -> Result<(), &'static str> {
        self.submit_after(Duration::ZERO, job)
    }

    fn submit_after(&self, delay: Duration, job: Job) -> Result<(), &'static str> {
        if self.disposed.load(Ordering::Acquire) {
            return Err("scheduler disposed");
        }
        self.enqueue(delay, job);
        Ok(())
    }
}

/// Deterministic scheduler driven by explicit time advances.
///
/// ```
/// use std::sync::{Arc, Mutex};
/// use std::time::Duration;
/// use rivulet::{Scheduler, VirtualTimeScheduler};
///
/// let vts = VirtualTimeScheduler::new();
/// let fired = Arc::new(Mutex::new(false));
/// let f = fired.clone();
/// vts.schedule_after(Duration::from_secs(3600), Box::new(move || *f.lock().unwrap() = true))
///     .unwrap();
///
/// vts.advance_time_by(Duration::from_secs(3599));
/// assert!(!*fired.lock().unwrap());
/// vts.advance_time_by(Duration::from_secs(1));
/// assert!(*fired.lock().unwrap());
/// ```
#[derive(Clone)]
pub struct VirtualTimeScheduler {
    clock: Arc<Clock>,
    name: Arc<str>,
}

impl Default for VirtualTimeScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualTimeScheduler {
    /// Creates a clock at virtual time zero.
    pub fn new() -> Self {
        Self {
            clock: Arc::new(Clock {
                state: Mutex::new(ClockState {
                    now: Duration::ZERO,
                    horizon: Duration::ZERO,
                    seq: 0,
                    queue: BTreeMap::new(),
                }),
                wip: WorkInProgress::new(),
                root: CancellationToken::new(),
                disposed: AtomicBool::new(false),
            }),
            name: Arc::from("virtual-time"),
        }
    }

    /// Runs every task due at the current virtual time.
    pub fn advance_time(&self) {
        self.clock.drain();
    }

    /// Moves the clock forward by `delta`, running due tasks in order.
    pub fn advance_time_by(&self, delta: Duration) {
        let target = self.clock.state.lock().horizon.saturating_add(delta);
        self.advance_time_to(target);
    }

    /// Moves the clock to `instant` (never backwards), running due tasks in order.
    pub fn advance_time_to(&self, instant: Duration) {
        {
            let mut st = self.clock.state.lock();
            if instant > st.horizon {
                st.horizon = instant;
            }
        }
        self.clock.drain();
    }

    /// Due time of the earliest live task.
    pub fn next_due(&self) -> Option<Duration> {
        self.clock
            .state
            .lock()
            .queue
            .iter()
            .find(|(_, job)| !job.token().is_cancelled())
            .map(|(&(due, _), _)| due)
    }

    /// True if a live task is due strictly before `now + within`.
    pub fn has_task_before(&self, within: Duration) -> bool {
        let limit = self.now().saturating_add(within);
        self.next_due().is_some_and(|due| due < limit)
    }

    /// Number of live queued tasks.
    pub fn pending_tasks(&self) -> usize {
        self.clock
            .state
            .lock()
            .queue
            .values()
            .filter(|job| !job.token().is_cancelled())
            .count()
    }
}

impl Scheduler for VirtualTimeScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_worker(&self) -> Worker {
        Worker::new(
            Arc::clone(&self.name),
            Arc::clone(&self.clock) as Arc<dyn Lane>,
            &self.clock.root,
            None,
        )
    }

    fn now(&self) -> Duration {
        self.clock.state.lock().now
    }

    fn dispose(&self) {
        self.clock.disposed.store(true, Ordering::Release);
        self.clock.root.cancel();
        self.clock.state.lock().queue.clear();
    }

    fn is_disposed(&self) -> bool {
        self.clock.disposed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Box<dyn FnOnce() + Send>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let make = move |tag: &'static str| -> Box<dyn FnOnce() + Send> {
            let l = l.clone();
            Box::new(move || l.lock().push(tag))
        };
        (log, make)
    }

    #[test]
    fn test_tasks_run_in_due_order() {
        let vts = VirtualTimeScheduler::new();
        let (log, task) = recorder();
        vts.schedule_after(Duration::from_secs(2), task("b")).unwrap();
        vts.schedule_after(Duration::from_secs(1), task("a")).unwrap();
        vts.schedule_after(Duration::from_secs(2), task("c")).unwrap();
        assert_eq!(vts.pending_tasks(), 3);
        assert_eq!(vts.next_due(), Some(Duration::from_secs(1)));

        vts.advance_time_by(Duration::from_secs(5));
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
        assert_eq!(vts.now(), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_delay_runs_immediately() {
        let vts = VirtualTimeScheduler::new();
        let (log, task) = recorder();
        vts.schedule(task("now")).unwrap();
        assert_eq!(*log.lock(), vec!["now"]);
    }

    #[test]
    fn test_cancelled_task_is_not_counted() {
        let vts = VirtualTimeScheduler::new();
        let (log, task) = recorder();
        let handle = vts.schedule_after(Duration::from_secs(1), task("x")).unwrap();
        assert!(vts.has_task_before(Duration::from_secs(2)));
        assert!(!vts.has_task_before(Duration::from_secs(1)));
        handle.cancel();
        assert_eq!(vts.pending_tasks(), 0);
        vts.advance_time_by(Duration::from_secs(1));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_nested_schedule_within_horizon_runs() {
        let vts = VirtualTimeScheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (v, l) = (vts.clone(), log.clone());
        vts.schedule_after(
            Duration::from_secs(1),
            Box::new(move || {
                l.lock().push(v.now());
                let l2 = l.clone();
                let v2 = v.clone();
                v.schedule_after(Duration::from_secs(1), Box::new(move || l2.lock().push(v2.now())))
                    .unwrap();
            }),
        )
        .unwrap();
        vts.advance_time_by(Duration::from_secs(3));
        assert_eq!(
            *log.lock(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }
}
