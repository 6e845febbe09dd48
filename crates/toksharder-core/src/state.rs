//! Pipeline lifecycle and cancellation flags, shared across pipeline threads

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Process-level lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    /// Source still yielding
    Running = 0,
    /// Source exhausted and every encode call finished; channel may hold batches
    Draining = 1,
    /// Channel drained and final flush done
    Terminated = 2,
    /// Fatal error upstream; the accumulator discards its buffer
    Aborted = 3,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::Draining,
            2 => Self::Terminated,
            _ => Self::Aborted,
        }
    }
}

/// Shared run state: lifecycle phase plus an external cancel flag.
///
/// The cancel flag is an `Arc<AtomicBool>` so a signal handler can own a clone.
#[derive(Debug)]
pub struct PipelineState {
    phase: AtomicU8,
    cancel: Arc<AtomicBool>,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineState {
    pub fn new() -> Self {
        Self::with_cancel_flag(Arc::new(AtomicBool::new(false)))
    }

    /// Use an existing flag (e.g. one registered with a signal handler).
    pub fn with_cancel_flag(cancel: Arc<AtomicBool>) -> Self {
        Self {
            phase: AtomicU8::new(Phase::Running as u8),
            cancel,
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// `Running → Draining`. Returns false if the run already left `Running`.
    pub fn begin_draining(&self) -> bool {
        self.transition(Phase::Running, Phase::Draining)
    }

    /// `Draining → Terminated`, or `Running → Terminated` after a cancel.
    pub fn terminate(&self) -> bool {
        self.transition(Phase::Draining, Phase::Terminated)
            || self.transition(Phase::Running, Phase::Terminated)
    }

    /// Mark the run as failed. Does not override `Terminated`.
    pub fn abort(&self) {
        let _ = self.transition(Phase::Running, Phase::Aborted)
            || self.transition(Phase::Draining, Phase::Aborted);
    }

    pub fn is_draining(&self) -> bool {
        self.phase() == Phase::Draining
    }

    pub fn is_aborted(&self) -> bool {
        self.phase() == Phase::Aborted
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Clone of the cancel flag for signal handlers
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn transition(&self, from: Phase, to: Phase) -> bool {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_lifecycle() {
        let state = PipelineState::new();
        assert_eq!(state.phase(), Phase::Running);
        assert!(state.begin_draining());
        assert!(state.is_draining());
        assert!(state.terminate());
        assert_eq!(state.phase(), Phase::Terminated);
    }

    #[test]
    fn draining_set_once() {
        let state = PipelineState::new();
        assert!(state.begin_draining());
        assert!(!state.begin_draining());
    }

    #[test]
    fn abort_does_not_undo_termination() {
        let state = PipelineState::new();
        state.begin_draining();
        state.terminate();
        state.abort();
        assert_eq!(state.phase(), Phase::Terminated);
    }

    #[test]
    fn draining_after_abort_is_refused() {
        let state = PipelineState::new();
        state.abort();
        assert!(!state.begin_draining());
        assert!(state.is_aborted());
    }

    #[test]
    fn shared_cancel_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let state = PipelineState::with_cancel_flag(flag.clone());
        assert!(!state.is_cancelled());
        flag.store(true, Ordering::Relaxed);
        assert!(state.is_cancelled());
    }
}
