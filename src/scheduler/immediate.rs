//! # Inline scheduler.
//!
//! Runs every task on the calling thread before `schedule` returns. Delayed
//! tasks are rejected: blocking the caller for the delay would turn a timer
//! into a sleep.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{Job, Lane, Scheduler, Worker};

struct InlineLane;

impl Lane for InlineLane {
    fn submit(&self, job: Job) -> Result<(), &'static str> {
        job.run();
        Ok(())
    }

    fn submit_after(&self, _delay: Duration, _job: Job) -> Result<(), &'static str> {
        Err("delayed tasks are not supported")
    }
}

/// Scheduler with no real workers; tasks run inline.
pub struct ImmediateScheduler {
    name: Arc<str>,
    lane: Arc<dyn Lane>,
    root: CancellationToken,
}

impl ImmediateScheduler {
    pub(crate) fn new() -> Self {
        Self {
            name: Arc::from("immediate"),
            lane: Arc::new(InlineLane),
            root: CancellationToken::new(),
        }
    }
}

impl Scheduler for ImmediateScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_worker(&self) -> Worker {
        Worker::new(Arc::clone(&self.name), Arc::clone(&self.lane), &self.root, None)
    }

    /// Nothing is ever pending, so there is nothing to drop.
    fn dispose(&self) {}

    fn is_disposed(&self) -> bool {
        false
    }
}
