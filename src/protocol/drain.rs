//! # Work-in-progress trampoline.
//!
//! Serializes emission for operators that are driven from several places
//! (requests, upstream signals, timers) without recursion.
//!
//! ```text
//! request(n) ──► enter()? ─yes─► loop { drain(); missed = leave(missed) } until 0
//!                   │
//!                   no ──► counter bumped; the active owner loops again
//! ```
//!
//! ## Rules
//! - Only the current owner touches the downstream subscriber.
//! - A re-entrant `request` from inside `on_signal` never recurses; it only
//!   bumps the counter, so stack depth stays constant.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Reentrancy counter guarding a drain loop.
#[derive(Debug, Default)]
pub(crate) struct WorkInProgress(AtomicUsize);

impl WorkInProgress {
    pub(crate) const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    /// Registers a drain request; `true` when the caller became the owner.
    #[inline]
    pub(crate) fn enter(&self) -> bool {
        self.0.fetch_add(1, Ordering::AcqRel) == 0
    }

    /// Acknowledges `missed` requests; returns how many arrived meanwhile.
    #[inline]
    pub(crate) fn leave(&self, missed: usize) -> usize {
        self.0.fetch_sub(missed, Ordering::AcqRel) - missed
    }

    /// Runs `f` as the owner, repeating while new requests arrived.
    ///
    /// The caller must already own the counter (via [`enter`](Self::enter)).
    pub(crate) fn run(&self, mut f: impl FnMut()) {
        let mut missed = 1;
        loop {
            f();
            missed = self.leave(missed);
            if missed == 0 {
                break;
            }
        }
    }

    /// Enters and runs `f`, or records the request for the active owner.
    pub(crate) fn drain(&self, f: impl FnMut()) {
        if self.enter() {
            self.run(f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_reentrant_requests_are_looped_not_recursed() {
        let wip = WorkInProgress::new();
        let rounds = Cell::new(0);
        wip.drain(|| {
            rounds.set(rounds.get() + 1);
            if rounds.get() < 1000 {
                // simulates a re-entrant request from inside the drain
                assert!(!wip.enter());
            }
        });
        assert_eq!(rounds.get(), 1000);
        assert!(wip.enter());
    }
}
