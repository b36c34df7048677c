//! # Tokio-backed worker lane.
//!
//! One lane is one tokio task draining an unbounded queue, so jobs of a lane
//! run in FIFO order and never overlap.
//!
//! ```text
//! submit(job) ──► [mpsc queue] ──► lane task ──► job.run()              (inline lanes)
//!                                           └──► spawn_blocking(job.run) (blocking lanes)
//! submit_after(d, job) ──► sleep(d) ──► [mpsc queue]
//! ```
//!
//! ## Rules
//! - The lane task exits when the scheduler's shutdown token is cancelled;
//!   queued jobs are dropped without running.
//! - A delayed job is dropped if its own token or the shutdown token is
//!   cancelled before the delay elapses.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Job, Lane};

pub(crate) struct TokioLane {
    tx: mpsc::UnboundedSender<Job>,
    handle: Handle,
    shutdown: CancellationToken,
}

impl TokioLane {
    /// Spawns the lane task on `handle`.
    ///
    /// Blocking lanes hand each job to the runtime's blocking pool and wait
    /// for it before taking the next one.
    pub(crate) fn spawn(handle: &Handle, shutdown: CancellationToken, blocking: bool) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let token = shutdown.clone();

        handle.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(job) if blocking => {
                            if let Err(e) = tokio::task::spawn_blocking(move || job.run()).await {
                                tracing::error!(error = %e, "blocking lane job failed to join");
                            }
                        }
                        Some(job) => job.run(),
                        None => break,
                    },
                }
            }
            tracing::debug!("worker lane stopped");
        });

        Self {
            tx,
            handle: handle.clone(),
            shutdown,
        }
    }
}

impl Lane for TokioLane {
    fn submit(&self, job: Job) -> Result<(), &'static str> {
        if self.shutdown.is_cancelled() {
            return Err("scheduler disposed");
        }
        self.tx.send(job).map_err(|_| "scheduler disposed")
    }

    fn submit_after(&self, delay: Duration, job: Job) -> Result<(), &'static str> {
        if self.shutdown.is_cancelled() {
            return Err("scheduler disposed");
        }
        if delay.is_zero() {
            return self.submit(job);
        }
        let tx = self.tx.clone();
        let shutdown = self.shutdown.clone();
        let job_token = job.token().clone();

        self.handle.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = job_token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(job);
                }
            }
        });
        Ok(())
    }
}
