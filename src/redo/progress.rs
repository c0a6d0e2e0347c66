//! Published log copy progress and LSN waits
//!
//! The tailer is the only writer. Everything else reads the scanned LSN,
//! waits for it to reach a value, or waits for the first full pass. All
//! waiters share one condition variable and re-check on every wake-up.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::backoff::BackoffPolicy;

use super::lsn::Lsn;

/// Why a wait returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Reached,
    /// The tailer ended before reaching the requested LSN
    TailerStopped,
    TimedOut,
}

/// Result of [`LsnProgress::wait_for`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LsnWait {
    pub requested: Lsn,
    /// Last scanned LSN observed, even when the wait failed
    pub reached: Lsn,
    pub outcome: WaitOutcome,
}

impl LsnWait {
    pub fn is_reached(&self) -> bool {
        self.reached >= self.requested
    }
}

#[derive(Debug)]
struct ProgressState {
    scanned: Lsn,
    first_pass: bool,
    target: Option<Lsn>,
    stopped: bool,
    failure: Option<String>,
}

/// Shared log copy progress
#[derive(Debug)]
pub struct LsnProgress {
    state: Mutex<ProgressState>,
    changed: Condvar,
}

impl Default for LsnProgress {
    fn default() -> Self {
        Self::new(Lsn::ZERO)
    }
}

impl LsnProgress {
    pub fn new(start: Lsn) -> Self {
        Self {
            state: Mutex::new(ProgressState {
                scanned: start,
                first_pass: false,
                target: None,
                stopped: false,
                failure: None,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn scanned(&self) -> Lsn {
        self.state.lock().scanned
    }

    /// Runs `dispatch` and then publishes `lsn`, both under the progress lock.
    ///
    /// Anything `dispatch` delivers is visible to a waiter before that
    /// waiter can observe `lsn`. The scanned LSN never moves backwards.
    pub fn publish_with<F: FnOnce()>(&self, lsn: Lsn, dispatch: F) {
        let mut state = self.state.lock();
        dispatch();
        if lsn > state.scanned {
            state.scanned = lsn;
        }
        self.changed.notify_all();
    }

    pub fn publish(&self, lsn: Lsn) {
        self.publish_with(lsn, || {});
    }

    /// Records that the tailer has caught up with the writer at least once
    pub fn mark_first_pass(&self) {
        let mut state = self.state.lock();
        if !state.first_pass {
            state.first_pass = true;
            self.changed.notify_all();
        }
    }

    pub fn first_pass_done(&self) -> bool {
        self.state.lock().first_pass
    }

    /// Fixes the LSN the tailer must reach before it may exit
    pub fn set_target(&self, target: Lsn) {
        let mut state = self.state.lock();
        state.target = Some(target);
        self.changed.notify_all();
    }

    pub fn target(&self) -> Option<Lsn> {
        self.state.lock().target
    }

    /// Records that the tailer has ended, with its error if it failed
    pub fn mark_stopped(&self, failure: Option<String>) {
        let mut state = self.state.lock();
        state.stopped = true;
        state.failure = failure;
        self.changed.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn failure(&self) -> Option<String> {
        self.state.lock().failure.clone()
    }

    /// Blocks until the first pass is done, the tailer stops, or `deadline`.
    ///
    /// Returns whether the first pass completed.
    pub fn wait_first_pass(&self, deadline: Option<Instant>) -> bool {
        let mut state = self.state.lock();
        while !state.first_pass && !state.stopped {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.changed.wait(&mut state),
            }
        }
        state.first_pass
    }

    /// Blocks until the scanned LSN reaches `lsn`, the tailer stops, or
    /// `deadline` passes.
    ///
    /// Each sleep is bounded by the policy's next delay so the condition is
    /// re-checked even without a wake-up. The policy never ends the wait on
    /// its own; once exhausted it keeps re-checking at its maximum delay.
    pub fn wait_for(
        &self,
        lsn: Lsn,
        deadline: Option<Instant>,
        policy: &dyn BackoffPolicy,
    ) -> LsnWait {
        let mut state = self.state.lock();
        let mut attempt = 1;
        loop {
            if state.scanned >= lsn {
                return LsnWait {
                    requested: lsn,
                    reached: state.scanned,
                    outcome: WaitOutcome::Reached,
                };
            }
            if state.stopped {
                return LsnWait {
                    requested: lsn,
                    reached: state.scanned,
                    outcome: WaitOutcome::TailerStopped,
                };
            }

            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                return LsnWait {
                    requested: lsn,
                    reached: state.scanned,
                    outcome: WaitOutcome::TimedOut,
                };
            }

            attempt += 1;
            let slice = policy
                .delay(attempt)
                .unwrap_or_else(|| policy.max_delay())
                .max(Duration::from_millis(1));
            let wake_at = match deadline {
                Some(d) => (now + slice).min(d),
                None => now + slice,
            };
            self.changed.wait_until(&mut state, wake_at);
        }
    }
}
