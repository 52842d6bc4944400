//! The termination coordinator.
//!
//! A single-writer state machine over Running -> Draining -> Stopped.
//! Workers only read: they poll the cancellation flag at the top of every
//! loop and after every blocking acquire. The first signal wins; later
//! signals are ignored, so cancellation is idempotent and safe from any
//! thread.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::metrics::OpKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Draining,
    Stopped,
}

/// Why the run ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopReason {
    /// The configured operation count was reached across all workers.
    CountReached,
    /// The configured wall-clock duration elapsed.
    DurationElapsed,
    /// A single successful sample exceeded its latency ceiling.
    SloBreach { kind: OpKind, latency_ms: u64 },
    /// External stop via the control surface.
    ExternalStop,
    /// The key stream (or a runner) ran dry.
    Exhausted,
}

impl StopReason {
    /// Whether the run counts as failed for status reporting.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::SloBreach { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            Self::CountReached => "operation count reached".to_string(),
            Self::DurationElapsed => "duration elapsed".to_string(),
            Self::SloBreach { kind, latency_ms } => {
                format!("latency SLO breach: {} sample took {latency_ms}ms", kind.name())
            }
            Self::ExternalStop => "stopped".to_string(),
            Self::Exhausted => "work exhausted".to_string(),
        }
    }
}

pub struct Terminator {
    cancelled: AtomicBool,
    reason: Mutex<Option<StopReason>>,
    state_tx: watch::Sender<RunState>,
    state_rx: watch::Receiver<RunState>,
}

impl Default for Terminator {
    fn default() -> Self {
        Self::new()
    }
}

impl Terminator {
    pub fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(RunState::Running);
        Self {
            cancelled: AtomicBool::new(false),
            reason: Mutex::new(None),
            state_tx,
            state_rx,
        }
    }

    /// Requests a drain. Only the first reason is kept.
    pub fn signal(&self, reason: StopReason) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.reason.lock() = Some(reason);
        self.state_tx.send_if_modified(|state| {
            if *state == RunState::Running {
                *state = RunState::Draining;
                true
            } else {
                false
            }
        });
        tracing::info!(reason = %reason.describe(), "draining");
    }

    /// Cheap flag for the dispatch hot path.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> RunState {
        *self.state_rx.borrow()
    }

    pub fn reason(&self) -> Option<StopReason> {
        *self.reason.lock()
    }

    /// Controller-only: every worker has observed cancellation and drained
    /// its in-flight window.
    pub fn mark_stopped(&self) {
        self.state_tx.send_if_modified(|state| {
            if *state == RunState::Stopped {
                false
            } else {
                *state = RunState::Stopped;
                true
            }
        });
    }

    /// Resolves once the coordinator reaches Stopped.
    pub async fn await_stopped(&self) {
        let mut rx = self.state_rx.clone();
        // an error means the sender is gone, which only happens at teardown
        let _ = rx.wait_for(|state| *state == RunState::Stopped).await;
    }
}
