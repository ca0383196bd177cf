//==============================================
// File: io/stream.rs
// License: Duality Public License (DPL v1.0)
// Goal: Output capture and the stderr replacement protocol
// Objective: Defer raw diagnostic rendering until a mapped version
//            exists, without ever losing a diagnostic
//==============================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::host::{OutputKind, TerminalSink};
use crate::transform::{MAIN_FILE, SYNTHETIC_MARKERS, TRACEBACK_MARKER};

/// How long after a successful replacement raw straggler frames are
/// still absorbed into the buffer instead of rendered.
const SUPPRESSION_WINDOW: Duration = Duration::from_millis(1500);

/// Delays for the cleanup passes that retract late-arriving raw frames
/// rendered behind the host's back.
const CLEANUP_DELAYS_MS: &[u64] = &[250, 750, 1500];

#[derive(Default)]
struct BufferState {
    buffering: bool,
    buffer: Vec<String>,
    last_mapped: Option<String>,
    suppress_until: Option<Instant>,
    stdout_log: String,
    stderr_log: String,
}

/// Accumulates stdout/stderr chunks for one execution. While buffering
/// is enabled, diagnostic-looking chunks are captured instead of
/// rendered so the mapped version can be swapped in atomically.
pub struct StreamBuffer {
    state: Arc<Mutex<BufferState>>,
    terminal: Arc<dyn TerminalSink>,
}

impl StreamBuffer {
    pub fn new(terminal: Arc<dyn TerminalSink>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BufferState::default())),
            terminal,
        }
    }

    /// Reset per-run logs and capture state.
    pub fn begin_run(&self) {
        let mut state = self.state.lock();
        state.buffering = false;
        state.buffer.clear();
        state.last_mapped = None;
        state.suppress_until = None;
        state.stdout_log.clear();
        state.stderr_log.clear();
    }

    pub fn enable_buffering(&self) {
        let mut state = self.state.lock();
        state.buffering = true;
        state.buffer.clear();
    }

    pub fn is_buffering(&self) -> bool {
        self.state.lock().buffering
    }

    /// VM output hook. Chunks are recorded into per-kind logs in
    /// emission order regardless of buffering.
    pub fn append(&self, kind: OutputKind, text: &str) {
        let capture = {
            let mut state = self.state.lock();
            match kind {
                OutputKind::Stdout => {
                    if !state.stdout_log.is_empty() {
                        state.stdout_log.push('\n');
                    }
                    state.stdout_log.push_str(text);
                }
                OutputKind::Stderr => {
                    if !state.stderr_log.is_empty() {
                        state.stderr_log.push('\n');
                    }
                    state.stderr_log.push_str(text);
                }
                _ => {}
            }

            let diagnostic_like = kind == OutputKind::Stderr
                || (kind == OutputKind::Stdout && looks_like_trace(text));
            let suppressed = state
                .suppress_until
                .is_some_and(|until| Instant::now() < until)
                && carries_synthetic_marker(text);

            if (state.buffering && diagnostic_like) || suppressed {
                state.buffer.push(text.to_string());
                true
            } else {
                false
            }
        };
        if !capture {
            self.terminal.append(text, kind);
        }
    }

    /// Disable buffering and swap the buffered raw diagnostic for the
    /// mapped text. With no mapped text, degrade through the fallback
    /// chain; a non-empty buffer always renders something.
    pub fn replace_buffered(&self, mapped: Option<&str>) {
        let final_text = {
            let mut state = self.state.lock();
            state.buffering = false;
            let raw = state.buffer.join("\n");
            state.buffer.clear();

            match mapped.filter(|text| !text.trim().is_empty()) {
                Some(text) => {
                    state.last_mapped = Some(text.to_string());
                    state.suppress_until = Some(Instant::now() + SUPPRESSION_WINDOW);
                    Some(text.to_string())
                }
                None => {
                    if let Some(previous) = state.last_mapped.clone() {
                        Some(previous)
                    } else if raw.is_empty() {
                        None
                    } else if carries_synthetic_marker(&raw) {
                        Some(substitute_markers(&raw))
                    } else {
                        Some(raw)
                    }
                }
            }
        };

        let Some(text) = final_text else {
            return;
        };

        // Retract raw frames that already slipped into the terminal.
        for marker in SYNTHETIC_MARKERS {
            self.terminal.remove_lines_containing(marker);
        }
        self.terminal.append(&text, OutputKind::Stderr);
        self.schedule_cleanup_passes();
    }

    /// Used when mapping itself threw.
    pub fn flush_raw(&self) {
        self.replace_buffered(None);
    }

    /// Force buffering off at the end of a run, flushing any residue.
    /// Buffering left enabled past a run would silently eat all future
    /// output.
    pub fn finish_run(&self) {
        let pending = {
            let state = self.state.lock();
            state.buffering && !state.buffer.is_empty()
        };
        if pending {
            self.flush_raw();
        } else {
            self.state.lock().buffering = false;
        }
    }

    pub fn last_mapped(&self) -> Option<String> {
        self.state.lock().last_mapped.clone()
    }

    pub fn raw_buffer_text(&self) -> String {
        self.state.lock().buffer.join("\n")
    }

    pub fn stdout_text(&self) -> String {
        self.state.lock().stdout_log.clone()
    }

    pub fn stderr_text(&self) -> String {
        self.state.lock().stderr_log.clone()
    }

    /// Late straggler frames can arrive after replacement through async
    /// callback timing; a few short delayed passes catch them.
    fn schedule_cleanup_passes(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        for delay_ms in CLEANUP_DELAYS_MS {
            let terminal = Arc::clone(&self.terminal);
            let delay = Duration::from_millis(*delay_ms);
            handle.spawn(async move {
                tokio::time::sleep(delay).await;
                for marker in SYNTHETIC_MARKERS {
                    terminal.remove_lines_containing(marker);
                }
            });
        }
    }
}

fn looks_like_trace(text: &str) -> bool {
    text.contains(TRACEBACK_MARKER) || carries_synthetic_marker(text)
}

fn carries_synthetic_marker(text: &str) -> bool {
    SYNTHETIC_MARKERS.iter().any(|marker| text.contains(marker))
}

fn substitute_markers(text: &str) -> String {
    let mut out = text.to_string();
    for marker in SYNTHETIC_MARKERS {
        out = out.replace(marker, MAIN_FILE);
    }
    out
}
