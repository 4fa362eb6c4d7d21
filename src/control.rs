//! Per-job control surface shared between the operator and the worker.
//!
//! The operator side only flips flags; the worker polls them at fixed
//! checkpoints (top of each item, inside retry waits, inside pause waits).

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;

/// Resume flag for a paused job. Resuming a job that is not paused is a no-op.
#[derive(Clone, Default)]
pub struct ResumeSignal {
    paused: Arc<AtomicBool>,
}

impl ResumeSignal {
    /// Enter the paused state. Called by the worker before it announces the pause.
    pub fn arm(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) -> bool {
        self.paused.swap(false, Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    Aborted,
}

#[derive(Clone, Default)]
pub struct JobControl {
    cancel: CancellationToken,
    resume: ResumeSignal,
}

impl JobControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn resume(&self) -> bool {
        self.resume.resume()
    }

    pub fn is_paused(&self) -> bool {
        self.resume.is_paused()
    }

    pub(crate) fn arm_pause(&self) {
        self.resume.arm();
    }

    /// Sleeps for `total`, waking every `poll` to check for abort.
    pub fn sleep(&self, total: Duration, poll: Duration) -> WaitOutcome {
        let deadline = Instant::now() + total;
        loop {
            if self.is_aborted() {
                return WaitOutcome::Aborted;
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::Completed;
            }
            thread::sleep(poll.min(deadline - now));
        }
    }

    /// Blocks until the operator resumes or aborts. Abort wins when both are set.
    pub fn wait_for_resume(&self, poll: Duration) -> WaitOutcome {
        loop {
            if self.is_aborted() {
                return WaitOutcome::Aborted;
            }
            if !self.resume.is_paused() {
                return WaitOutcome::Completed;
            }
            thread::sleep(poll);
        }
    }
}
