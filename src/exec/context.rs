use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Per-run cancellation token. Both timeout paths and the user stop
/// control trigger it; once triggered, later settlement of the VM call
/// is moot.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Starting,
    Running,
    Mapping,
}

struct RunState {
    phase: RunPhase,
    cancel: Option<CancelToken>,
    hard_deadline: Option<Instant>,
    safety_deadline: Option<Instant>,
}

/// Explicit run-state holder with one instance per session, injected
/// into the components that need it. The central invariant: every exit
/// path returns this to a clean idle state — no code path may leave the
/// running flag up after handing control back.
pub struct ExecutionContext {
    state: Mutex<RunState>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RunState {
                phase: RunPhase::Idle,
                cancel: None,
                hard_deadline: None,
                safety_deadline: None,
            }),
        }
    }

    /// Single-flight gate. Returns false without touching anything when
    /// a run is already active.
    pub fn try_begin(&self, cancel: CancelToken) -> bool {
        let mut state = self.state.lock();
        if state.phase != RunPhase::Idle {
            return false;
        }
        state.phase = RunPhase::Starting;
        state.cancel = Some(cancel);
        true
    }

    pub fn set_phase(&self, phase: RunPhase) {
        self.state.lock().phase = phase;
    }

    pub fn phase(&self) -> RunPhase {
        self.state.lock().phase
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().phase != RunPhase::Idle
    }

    pub fn set_deadlines(&self, hard: Instant, safety: Instant) {
        let mut state = self.state.lock();
        state.hard_deadline = Some(hard);
        state.safety_deadline = Some(safety);
    }

    pub fn hard_deadline(&self) -> Option<Instant> {
        self.state.lock().hard_deadline
    }

    pub fn safety_deadline(&self) -> Option<Instant> {
        self.state.lock().safety_deadline
    }

    /// Trigger the current run's cancel token, if any.
    pub fn cancel_current(&self) -> bool {
        let cancel = self.state.lock().cancel.clone();
        match cancel {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Restore idle state and clear both timeout deadlines. Invoked on
    /// every exit path.
    pub fn finish(&self) {
        let mut state = self.state.lock();
        state.phase = RunPhase::Idle;
        state.cancel = None;
        state.hard_deadline = None;
        state.safety_deadline = None;
    }
}
