//==============================================
// File: io/rendezvous.rs
// License: Duality Public License (DPL v1.0)
// Goal: Stdin request/response rendezvous
// Objective: Turn the guest's blocking read into a bounded async wait
//            satisfied by a later host-side event
//==============================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::host::{OutputKind, TerminalSink};
use crate::vm::InputFuture;

/// Ceiling on how long a guest input request may wait for a value.
/// After this every queued caller resolves with an empty string so the
/// run can make forward progress instead of hanging.
pub const INPUT_WAIT_CEILING: Duration = Duration::from_secs(60);

struct RendezvousState {
    waiters: Vec<oneshot::Sender<String>>,
    announced: bool,
    history: Vec<String>,
    cancelled: bool,
    /// Bumped on every resolution; stale bounded-wait timers compare
    /// against it and become no-ops.
    generation: u64,
}

/// The stdin rendezvous. At most one logical request is active at a
/// time, but several resolvers may be queued against the same answer
/// when the interpreter's legacy synchronous hook and its async input
/// hook both fire for one guest read.
pub struct StdinRendezvous {
    inner: Arc<Mutex<RendezvousState>>,
    terminal: Arc<dyn TerminalSink>,
}

impl StdinRendezvous {
    pub fn new(terminal: Arc<dyn TerminalSink>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RendezvousState {
                waiters: Vec::new(),
                announced: false,
                history: Vec::new(),
                cancelled: false,
                generation: 0,
            })),
            terminal,
        }
    }

    /// Reset per-run bookkeeping. Called by the supervisor at the start
    /// of every run.
    pub fn begin_run(&self) {
        let mut state = self.inner.lock();
        state.history.clear();
        state.cancelled = false;
        state.announced = false;
        state.generation = state.generation.wrapping_add(1);
    }

    /// Guest-side entry point, wired into the VM's input hook. The
    /// first caller for an outstanding request echoes the prompt and
    /// enables the input affordance exactly once; concurrent callers
    /// join the waiter queue silently.
    pub fn request_input(&self, prompt: &str) -> InputFuture {
        let inner = Arc::clone(&self.inner);
        let terminal = Arc::clone(&self.terminal);
        let prompt = prompt.to_string();

        Box::pin(async move {
            let (receiver, generation, first) = {
                let mut state = inner.lock();
                if state.cancelled {
                    return String::new();
                }
                let (sender, receiver) = oneshot::channel();
                state.waiters.push(sender);
                let first = !state.announced;
                state.announced = true;
                (receiver, state.generation, first)
            };

            if first {
                if !prompt.is_empty() {
                    terminal.append(&prompt, OutputKind::Stdout);
                }
                terminal.set_input_enabled(true, &prompt);
            }

            match timeout(INPUT_WAIT_CEILING, receiver).await {
                Ok(Ok(value)) => value,
                Ok(Err(_)) => String::new(),
                Err(_) => {
                    tracing::debug!("stdin_wait_ceiling_elapsed generation={generation}");
                    resolve_generation(&inner, &terminal, generation, "", false);
                    String::new()
                }
            }
        })
    }

    /// Host-side resolution: a value arrived from the UI or a test
    /// harness. Every queued resolver receives the same value.
    pub fn supply(&self, value: &str) {
        let mut state = self.inner.lock();
        state.history.push(value.to_string());
        drop(state);
        self.terminal.append(value, OutputKind::StdinEcho);
        resolve_all(&self.inner, &self.terminal, value);
    }

    /// Resolve any outstanding request with an empty string because the
    /// run is stopping. Late `request_input` calls for the same run
    /// resolve instantly.
    pub fn cancel_pending(&self) {
        self.inner.lock().cancelled = true;
        resolve_all(&self.inner, &self.terminal, "");
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.lock().waiters.is_empty()
    }

    /// Newline-joined stdin history for the current run, consumed by
    /// the feedback evaluator.
    pub fn history(&self) -> String {
        self.inner.lock().history.join("\n")
    }
}

fn resolve_all(inner: &Arc<Mutex<RendezvousState>>, terminal: &Arc<dyn TerminalSink>, value: &str) {
    let generation = inner.lock().generation;
    resolve_generation(inner, terminal, generation, value, true);
}

fn resolve_generation(
    inner: &Arc<Mutex<RendezvousState>>,
    terminal: &Arc<dyn TerminalSink>,
    generation: u64,
    value: &str,
    force: bool,
) {
    let waiters = {
        let mut state = inner.lock();
        if !force && state.generation != generation {
            // A resolution already happened; the timer is stale.
            return;
        }
        state.generation = state.generation.wrapping_add(1);
        state.announced = false;
        std::mem::take(&mut state.waiters)
    };
    if waiters.is_empty() {
        return;
    }
    for sender in waiters {
        let _ = sender.send(value.to_string());
    }
    terminal.set_input_enabled(false, "");
}
