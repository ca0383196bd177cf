//==============================================
// File: exec/mod.rs
// License: Duality Public License (DPL v1.0)
// Goal: Run orchestration
// Objective: Drive one guest execution through transform, timeout races,
//            failure classification, and the mapped-diagnostic pipeline
//==============================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep, sleep_until};

use crate::config::Config;
use crate::errors::{ErrorCode, ExecError};
use crate::host::{HostHandles, OutputKind, RunRecord};
use crate::io::{StdinRendezvous, StreamBuffer};
use crate::transform::{LineMapper, MapContext, transform};
use crate::vm::{ClearStateOptions, HostCallbacks, RuntimeAdapter, VmError, VmLifecycle};

pub mod classify;
pub mod context;


pub use classify::{VmFailure, classify_raised};
pub use context::{CancelToken, ExecutionContext, RunPhase};

/// Unwind allowance after a delivered safety interrupt, before the run
/// is classified as stalled.
const INTERRUPT_GRACE: Duration = Duration::from_secs(2);

/// Snippets under this size with no write-like tokens skip the
/// filesystem push/pull around the run.
const READ_ONLY_SNIPPET_LIMIT: usize = 400;
const READ_ONLY_HINTS: &[&str] = &["print(", "input("];
const WRITE_TOKENS: &[&str] = &[
    "open(", "write", "os.", "shutil", "remove(", "rmdir", "mkdir", "rename(", "unlink(",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    SkippedAlreadyRunning,
    Cancelled,
    TimedOut,
    SafetyStalled,
    Interrupted,
    Recovered,
    RecoveryFailed,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub stdout: String,
    pub stderr: String,
}

enum Disposition {
    Settled(Result<(), VmError>),
    SettledAfterInterrupt(Result<(), VmError>),
    Cancelled,
    HardTimeout,
    SafetyStall,
}

/// Wire the stream buffer and stdin rendezvous up as the callbacks a VM
/// adapter registers at construction time.
pub fn host_callbacks(stream: Arc<StreamBuffer>, rendezvous: Arc<StdinRendezvous>) -> HostCallbacks {
    let stdout_stream = Arc::clone(&stream);
    let stderr_stream = stream;
    HostCallbacks {
        stdout: Arc::new(move |text: &str| stdout_stream.append(OutputKind::Stdout, text)),
        stderr: Arc::new(move |text: &str| stderr_stream.append(OutputKind::Stderr, text)),
        stdin: Arc::new(move |prompt: String| rendezvous.request_input(&prompt)),
    }
}

/// Drives one run at a time: transform, VM invocation raced against the
/// hard and safety timeouts, exit classification, and the mapped-stderr
/// replacement protocol. Exclusively owns the interpreter while a run
/// is active.
pub struct ExecutionSupervisor {
    config: Config,
    context: Arc<ExecutionContext>,
    lifecycle: Arc<VmLifecycle>,
    rendezvous: Arc<StdinRendezvous>,
    stream: Arc<StreamBuffer>,
    mapper: LineMapper,
    host: HostHandles,
}

impl ExecutionSupervisor {
    pub fn new(
        config: Config,
        context: Arc<ExecutionContext>,
        lifecycle: Arc<VmLifecycle>,
        rendezvous: Arc<StdinRendezvous>,
        stream: Arc<StreamBuffer>,
        host: HostHandles,
    ) -> Self {
        let mapper = LineMapper::new(Arc::clone(&host.editor), Arc::clone(&host.files));
        Self {
            config,
            context,
            lifecycle,
            rendezvous,
            stream,
            mapper,
            host,
        }
    }

    pub fn context(&self) -> Arc<ExecutionContext> {
        Arc::clone(&self.context)
    }

    /// User-initiated stop: trigger the current run's cancel token and
    /// release anyone blocked on stdin.
    pub fn cancel(&self) {
        if self.context.cancel_current() {
            self.rendezvous.cancel_pending();
        }
    }

    /// Execute `source` as the program at `path`. At most one run may
    /// be active; a second call is a no-op that leaves the live run
    /// untouched.
    pub async fn run(&self, source: &str, path: &str) -> Result<RunSummary, ExecError> {
        let cancel = CancelToken::new();
        if !self.context.try_begin(cancel.clone()) {
            tracing::debug!("run_skipped_already_running");
            return Ok(RunSummary {
                outcome: RunOutcome::SkippedAlreadyRunning,
                stdout: String::new(),
                stderr: String::new(),
            });
        }

        let result = self.run_inner(source, path, &cancel).await;

        // Every exit path flows through here: pending input released,
        // buffering off, interpreter state cleared. The run stays
        // marked active until the interpreter is clean again, so no
        // new run can reach the adapter mid-recovery.
        self.rendezvous.cancel_pending();
        self.stream.finish_run();
        self.notify_feedback();
        if !skip_fs_sync(source) {
            self.sync_files_out();
        }
        let recovery = self
            .lifecycle
            .clear_state(ClearStateOptions::default())
            .await;
        tracing::debug!("post_run_recovery outcome={recovery:?}");
        self.context.finish();

        result.map(|outcome| self.summarize(outcome))
    }

    async fn run_inner(
        &self,
        source: &str,
        path: &str,
        cancel: &CancelToken,
    ) -> Result<RunOutcome, ExecError> {
        self.rendezvous.begin_run();
        self.stream.begin_run();
        self.host.editor.clear_highlights();

        let adapter = self.lifecycle.adapter();
        if !adapter.is_ready() {
            return Err(ExecError::Vm(VmError::NotReady));
        }

        if !skip_fs_sync(source) {
            self.sync_files_in(adapter.as_ref());
        }

        let caps = adapter.capabilities();
        let (code, header_line_count, line_map, expansion) = if caps.supports_native_async {
            (source.to_string(), 0usize, None, 1usize)
        } else {
            let transformed = transform(source);
            (
                transformed.code,
                transformed.header_line_count,
                transformed.line_map,
                transformed.expansion,
            )
        };

        self.stream.enable_buffering();

        let execution = &self.config.execution;
        let hard = Duration::from_secs(execution.timeout_seconds);
        let safety =
            Duration::from_secs(execution.safety_timeout_seconds.min(execution.timeout_seconds));
        let started = Instant::now();
        let hard_at = started + hard;
        let safety_at = started + safety;
        self.context.set_deadlines(hard_at, safety_at);
        self.context.set_phase(RunPhase::Running);

        let run_fut = adapter.run(&code);
        tokio::pin!(run_fut);

        let disposition = tokio::select! {
            biased;
            result = &mut run_fut => Disposition::Settled(result),
            _ = cancel.cancelled() => Disposition::Cancelled,
            _ = sleep_until(safety_at) => {
                tracing::debug!("safety_timeout_fired seconds={}", safety.as_secs());
                if self.lifecycle.interrupt() {
                    // Give the guest a moment to unwind through its own
                    // interrupt exception before declaring a stall.
                    tokio::select! {
                        biased;
                        result = &mut run_fut => Disposition::SettledAfterInterrupt(result),
                        _ = cancel.cancelled() => Disposition::Cancelled,
                        _ = sleep_until(hard_at) => Disposition::HardTimeout,
                        _ = sleep(INTERRUPT_GRACE) => Disposition::SafetyStall,
                    }
                } else {
                    Disposition::SafetyStall
                }
            }
            _ = sleep_until(hard_at) => Disposition::HardTimeout,
        };

        self.context.set_phase(RunPhase::Mapping);

        match disposition {
            Disposition::Settled(Ok(())) | Disposition::SettledAfterInterrupt(Ok(())) => {
                Ok(RunOutcome::Completed)
            }
            Disposition::Settled(Err(err)) => self.handle_vm_error(
                err,
                false,
                header_line_count,
                path,
                line_map.as_ref(),
                expansion,
            ),
            Disposition::SettledAfterInterrupt(Err(err)) => self.handle_vm_error(
                err,
                true,
                header_line_count,
                path,
                line_map.as_ref(),
                expansion,
            ),
            Disposition::Cancelled => {
                self.lifecycle.interrupt();
                self.notice(ErrorCode::Cancelled, "execution cancelled");
                Ok(RunOutcome::Cancelled)
            }
            Disposition::HardTimeout => {
                cancel.cancel();
                self.lifecycle.interrupt();
                self.notice(
                    ErrorCode::Timeout,
                    &format!("execution timeout: exceeded the {}s limit", hard.as_secs()),
                );
                Ok(RunOutcome::TimedOut)
            }
            Disposition::SafetyStall => {
                cancel.cancel();
                self.notice(
                    ErrorCode::SafetyStall,
                    "execution appears stuck in a loop; add yield points or reduce the work per iteration",
                );
                Ok(RunOutcome::SafetyStalled)
            }
        }
    }

    fn handle_vm_error(
        &self,
        err: VmError,
        after_safety_interrupt: bool,
        header_line_count: usize,
        path: &str,
        line_map: Option<&HashMap<usize, usize>>,
        expansion: usize,
    ) -> Result<RunOutcome, ExecError> {
        match err {
            VmError::Interrupted => Ok(self.interrupt_outcome(after_safety_interrupt)),
            VmError::Raised { traceback } => match classify_raised(&traceback) {
                VmFailure::Interrupt => Ok(self.interrupt_outcome(after_safety_interrupt)),
                VmFailure::IoInterrupted => {
                    self.rendezvous.cancel_pending();
                    self.notice(
                        ErrorCode::IoInterrupted,
                        "a blocked read was interrupted; pending input was cleared",
                    );
                    Ok(RunOutcome::Interrupted)
                }
                VmFailure::ConcurrencyConflict => {
                    let recovered = self.lifecycle.recover_async_state();
                    if recovered {
                        self.notice(
                            ErrorCode::ConcurrencyConflict,
                            "interpreter async state was inconsistent and has been reset; the next run should work",
                        );
                        Ok(RunOutcome::Recovered)
                    } else {
                        self.notice(
                            ErrorCode::ConcurrencyConflict,
                            "interpreter async state could not be reset; a page reload may be required",
                        );
                        Ok(RunOutcome::RecoveryFailed)
                    }
                }
                VmFailure::Configuration => {
                    self.stream.flush_raw();
                    self.notice(ErrorCode::Configuration, traceback.trim());
                    Err(ExecError::Configuration(traceback))
                }
                VmFailure::GuestTraceback => {
                    let ctx = MapContext {
                        header_line_count,
                        original_path: path,
                        line_map,
                        expansion,
                    };
                    let mapped = self.mapper.map_locations(&traceback, &ctx);
                    if mapped.trim().is_empty() {
                        self.stream.flush_raw();
                    } else {
                        self.stream.replace_buffered(Some(&mapped));
                    }
                    tracing::debug!("guest_error code={}", ErrorCode::GuestRuntime.as_str());
                    Ok(RunOutcome::Completed)
                }
                VmFailure::Other => {
                    self.stream.flush_raw();
                    self.notice(
                        ErrorCode::Internal,
                        &format!("runtime error: {}", traceback.trim()),
                    );
                    Err(ExecError::Vm(VmError::Raised { traceback }))
                }
            },
            other => {
                self.stream.flush_raw();
                self.notice(ErrorCode::Internal, &format!("runtime error: {other}"));
                Err(ExecError::Vm(other))
            }
        }
    }

    fn interrupt_outcome(&self, after_safety_interrupt: bool) -> RunOutcome {
        if after_safety_interrupt {
            self.notice(
                ErrorCode::SafetyStall,
                "execution appears stuck in a loop and was interrupted",
            );
            RunOutcome::SafetyStalled
        } else {
            self.notice(ErrorCode::Interrupted, "execution interrupted");
            RunOutcome::Interrupted
        }
    }

    fn notice(&self, code: ErrorCode, text: &str) {
        self.host
            .terminal
            .append(&format!("[{}] {text}", code.as_str()), OutputKind::RuntimeNotice);
    }

    /// Final stderr for observers: mapped text first, the raw stderr
    /// log next, the rendered terminal content as a last resort.
    fn current_stderr(&self) -> String {
        if let Some(mapped) = self.stream.last_mapped().filter(|text| !text.is_empty()) {
            return mapped;
        }
        let raw = self.stream.stderr_text();
        if !raw.is_empty() {
            return raw;
        }
        self.host.terminal.scrape(OutputKind::Stderr)
    }

    fn summarize(&self, outcome: RunOutcome) -> RunSummary {
        RunSummary {
            outcome,
            stdout: self.stream.stdout_text(),
            stderr: self.current_stderr(),
        }
    }

    fn notify_feedback(&self) {
        let record = RunRecord {
            stdout: self.stream.stdout_text(),
            stderr: self.current_stderr(),
            stdin: self.rendezvous.history(),
            filenames: self.host.files.list(),
        };
        self.host.feedback.evaluate_run(&record);
    }

    /// Push externally-modified file content into the interpreter
    /// filesystem before the run. Best-effort per file.
    fn sync_files_in(&self, adapter: &dyn RuntimeAdapter) {
        for path in self.host.files.list() {
            let Some(content) = self.host.files.read(&path) else {
                continue;
            };
            if matches!(adapter.fs_read(&path), Ok(existing) if existing == content) {
                continue;
            }
            if let Some(parent) = parent_of(&path) {
                if let Err(err) = adapter.fs_mkdirp(parent) {
                    tracing::debug!("fs_push_mkdir_failed path={path} err={err}");
                }
            }
            if let Err(err) = adapter.fs_write(&path, &content) {
                tracing::debug!("fs_push_failed path={path} err={err}");
            }
        }
    }

    /// Pull interpreter filesystem changes back into the store after
    /// the run, honoring per-path read-only guards.
    fn sync_files_out(&self) {
        let adapter = self.lifecycle.adapter();
        let paths = match adapter.fs_list() {
            Ok(paths) => paths,
            Err(err) => {
                tracing::debug!("fs_pull_list_failed err={err}");
                return;
            }
        };
        for path in paths {
            if self.config.is_read_only(&path) {
                continue;
            }
            let Ok(content) = adapter.fs_read(&path) else {
                continue;
            };
            if self.host.files.read(&path).as_deref() == Some(content.as_str()) {
                continue;
            }
            if let Err(err) = self.host.files.write(&path, &content) {
                tracing::debug!("fs_pull_failed path={path} err={err}");
            }
        }
    }
}

/// Short read-only snippets (prints and input prompts, no write-like
/// tokens) skip the filesystem push/pull entirely.
fn skip_fs_sync(source: &str) -> bool {
    source.len() <= READ_ONLY_SNIPPET_LIMIT
        && READ_ONLY_HINTS.iter().any(|hint| source.contains(hint))
        && !WRITE_TOKENS.iter().any(|token| source.contains(token))
}

fn parent_of(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    if idx == 0 { None } else { Some(&trimmed[..idx]) }
}
