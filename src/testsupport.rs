//=============================================
// tidepool/src/testsupport.rs
//=============================================
// Purpose: Shared doubles and a scripted interpreter for unit suites.
//=============================================

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::sleep;

use crate::config::Config;
use crate::exec::{ExecutionContext, ExecutionSupervisor, host_callbacks};
use crate::host::{
    Editor, FeedbackEvaluator, FileStore, HostHandles, OutputKind, RunRecord, TerminalSink,
};
use crate::io::{StdinRendezvous, StreamBuffer};
use crate::vm::{
    HostCallbacks, RuntimeAdapter, VmCapabilities, VmError, VmFactory, VmFuture, VmLifecycle,
};

#[derive(Default)]
pub struct RecordingTerminal {
    lines: Mutex<Vec<(OutputKind, String)>>,
    input_events: Mutex<Vec<(bool, String)>>,
}

impl RecordingTerminal {
    pub fn lines_of(&self, kind: OutputKind) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn all_text(&self) -> String {
        self.lines
            .lock()
            .iter()
            .map(|(_, text)| text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn input_events(&self) -> Vec<(bool, String)> {
        self.input_events.lock().clone()
    }

    pub fn enable_count(&self) -> usize {
        self.input_events
            .lock()
            .iter()
            .filter(|(enabled, _)| *enabled)
            .count()
    }
}

impl TerminalSink for RecordingTerminal {
    fn append(&self, text: &str, kind: OutputKind) {
        self.lines.lock().push((kind, text.to_string()));
    }

    fn set_input_enabled(&self, enabled: bool, prompt: &str) {
        self.input_events
            .lock()
            .push((enabled, prompt.to_string()));
    }

    fn remove_lines_containing(&self, needle: &str) {
        self.lines.lock().retain(|(_, text)| !text.contains(needle));
    }

    fn scrape(&self, kind: OutputKind) -> String {
        self.lines_of(kind).join("\n")
    }
}

#[derive(Default)]
pub struct RecordingEditor {
    highlights: Mutex<Vec<(String, usize)>>,
    clear_calls: AtomicUsize,
}

impl RecordingEditor {
    pub fn highlights(&self) -> Vec<(String, usize)> {
        self.highlights.lock().clone()
    }

    pub fn clear_calls(&self) -> usize {
        self.clear_calls.load(Ordering::SeqCst)
    }
}

impl Editor for RecordingEditor {
    fn set_content(&self, _path: &str, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn highlight_line(&self, path: &str, line: usize) {
        self.highlights.lock().push((path.to_string(), line));
    }

    fn clear_highlights(&self) {
        self.clear_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn set_read_only(&self, _read_only: bool) {}
}

#[derive(Default)]
pub struct MemoryFiles {
    map: Mutex<BTreeMap<String, String>>,
}

impl MemoryFiles {
    pub fn with_main(content: &str) -> Arc<Self> {
        let files = Self::default();
        files
            .map
            .lock()
            .insert("/main.py".to_string(), content.to_string());
        Arc::new(files)
    }
}

impl FileStore for MemoryFiles {
    fn read(&self, path: &str) -> Option<String> {
        self.map.lock().get(path).cloned()
    }

    fn write(&self, path: &str, content: &str) -> anyhow::Result<()> {
        self.map.lock().insert(path.to_string(), content.to_string());
        Ok(())
    }

    fn list(&self) -> Vec<String> {
        self.map.lock().keys().cloned().collect()
    }

    fn delete(&self, path: &str) -> anyhow::Result<()> {
        self.map.lock().remove(path);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingFeedback {
    records: Mutex<Vec<RunRecord>>,
}

impl RecordingFeedback {
    pub fn records(&self) -> Vec<RunRecord> {
        self.records.lock().clone()
    }
}

impl FeedbackEvaluator for RecordingFeedback {
    fn evaluate_run(&self, record: &RunRecord) {
        self.records.lock().push(record.clone());
    }
}

/// One scripted action performed by the fake interpreter during `run`.
pub enum Step {
    Stdout(String),
    Stderr(String),
    /// Request a line through the stdin hook, then echo
    /// `reply_template` with `{}` replaced by the supplied value.
    Prompt {
        prompt: String,
        reply_template: String,
    },
    /// Busy guest work; observes interrupts between slices.
    SleepMs(u64),
    /// Busy guest work that ignores interrupts entirely.
    BusyMs(u64),
    Fail(VmError),
    FailRaised(String),
}

const CONTROL_SNIPPET_PREFIX: &str = "import sys as __tp_sys";
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Fake interpreter driven by a queued step script. Control snippets
/// (the lifecycle cleanup code) are acknowledged without consuming the
/// script.
pub struct ScriptedVm {
    caps: Mutex<VmCapabilities>,
    steps: Mutex<VecDeque<Step>>,
    callbacks: HostCallbacks,
    interrupted: Arc<AtomicBool>,
    yielding: AtomicBool,
    ready: AtomicBool,
    fail_reset_async: AtomicBool,
    fs: Mutex<BTreeMap<String, String>>,
    notifications_suppressed: AtomicBool,
    codes: Mutex<Vec<String>>,
    control_codes: Mutex<Vec<String>>,
    control_delay_ms: AtomicU64,
    shutdown_calls: AtomicUsize,
    bridge_registrations: AtomicUsize,
}

impl ScriptedVm {
    pub fn new(callbacks: HostCallbacks) -> Arc<Self> {
        Arc::new(Self {
            caps: Mutex::new(VmCapabilities {
                supports_native_async: false,
                supports_interrupt: true,
                supports_yielding: false,
            }),
            steps: Mutex::new(VecDeque::new()),
            callbacks,
            interrupted: Arc::new(AtomicBool::new(false)),
            yielding: AtomicBool::new(false),
            ready: AtomicBool::new(true),
            fail_reset_async: AtomicBool::new(false),
            fs: Mutex::new(BTreeMap::new()),
            notifications_suppressed: AtomicBool::new(false),
            codes: Mutex::new(Vec::new()),
            control_codes: Mutex::new(Vec::new()),
            control_delay_ms: AtomicU64::new(0),
            shutdown_calls: AtomicUsize::new(0),
            bridge_registrations: AtomicUsize::new(0),
        })
    }

    pub fn set_caps(&self, caps: VmCapabilities) {
        *self.caps.lock() = caps;
    }

    pub fn push_step(&self, step: Step) {
        self.steps.lock().push_back(step);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_fail_reset_async(&self, fail: bool) {
        self.fail_reset_async.store(fail, Ordering::SeqCst);
    }

    /// Make lifecycle control snippets take this long to execute.
    pub fn set_control_delay_ms(&self, delay: u64) {
        self.control_delay_ms.store(delay, Ordering::SeqCst);
    }

    pub fn set_file(&self, path: &str, content: &str) {
        self.fs.lock().insert(path.to_string(), content.to_string());
    }

    /// Guest programs executed so far (control snippets excluded).
    pub fn guest_codes(&self) -> Vec<String> {
        self.codes.lock().clone()
    }

    /// Lifecycle control snippets executed so far.
    pub fn control_codes(&self) -> Vec<String> {
        self.control_codes.lock().clone()
    }

    pub fn shutdown_calls(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    pub fn bridge_registrations(&self) -> usize {
        self.bridge_registrations.load(Ordering::SeqCst)
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.fs.lock().get(path).cloned()
    }
}

impl RuntimeAdapter for ScriptedVm {
    fn capabilities(&self) -> VmCapabilities {
        *self.caps.lock()
    }

    fn run<'a>(&'a self, code: &'a str) -> VmFuture<'a> {
        Box::pin(async move {
            if code.starts_with(CONTROL_SNIPPET_PREFIX) {
                self.control_codes.lock().push(code.to_string());
                let delay = self.control_delay_ms.load(Ordering::SeqCst);
                if delay > 0 {
                    sleep(Duration::from_millis(delay)).await;
                }
                return Ok(());
            }
            self.codes.lock().push(code.to_string());
            loop {
                if self.interrupted.load(Ordering::SeqCst) {
                    return Err(VmError::Interrupted);
                }
                let step = self.steps.lock().pop_front();
                let Some(step) = step else {
                    return Ok(());
                };
                match step {
                    Step::Stdout(text) => (self.callbacks.stdout)(&text),
                    Step::Stderr(text) => (self.callbacks.stderr)(&text),
                    Step::Prompt {
                        prompt,
                        reply_template,
                    } => {
                        let value = (self.callbacks.stdin)(prompt).await;
                        (self.callbacks.stdout)(&reply_template.replace("{}", &value));
                    }
                    Step::SleepMs(total) => {
                        let mut remaining = Duration::from_millis(total);
                        while remaining > Duration::ZERO {
                            if self.interrupted.load(Ordering::SeqCst) {
                                return Err(VmError::Raised {
                                    traceback: "KeyboardInterrupt".to_string(),
                                });
                            }
                            let slice = remaining.min(SLEEP_SLICE);
                            sleep(slice).await;
                            remaining -= slice;
                        }
                    }
                    Step::BusyMs(total) => {
                        sleep(Duration::from_millis(total)).await;
                    }
                    Step::Fail(err) => return Err(err),
                    Step::FailRaised(traceback) => {
                        return Err(VmError::Raised { traceback });
                    }
                }
            }
        })
    }

    fn interrupt(&self) -> Result<(), VmError> {
        let caps = self.capabilities();
        if caps.supports_interrupt || self.yielding.load(Ordering::SeqCst) {
            self.interrupted.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(VmError::Unsupported("interrupt"))
        }
    }

    fn set_yielding(&self, enabled: bool) -> Result<(), VmError> {
        if self.capabilities().supports_yielding {
            self.yielding.store(enabled, Ordering::SeqCst);
            Ok(())
        } else {
            Err(VmError::Unsupported("yielding"))
        }
    }

    fn clear_interrupt(&self) -> Result<(), VmError> {
        self.interrupted.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn reset_async_state(&self) -> Result<(), VmError> {
        if self.fail_reset_async.load(Ordering::SeqCst) {
            Err(VmError::Internal("async state stuck".to_string()))
        } else {
            Ok(())
        }
    }

    fn reinit_repl(&self) -> Result<(), VmError> {
        Ok(())
    }

    fn register_bridge(&self) -> Result<(), VmError> {
        self.bridge_registrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn fs_read(&self, path: &str) -> Result<String, VmError> {
        self.fs
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| VmError::Filesystem(format!("no such file: {path}")))
    }

    fn fs_write(&self, path: &str, content: &str) -> Result<(), VmError> {
        self.fs.lock().insert(path.to_string(), content.to_string());
        Ok(())
    }

    fn fs_list(&self) -> Result<Vec<String>, VmError> {
        Ok(self.fs.lock().keys().cloned().collect())
    }

    fn fs_mkdirp(&self, _path: &str) -> Result<(), VmError> {
        Ok(())
    }

    fn fs_suppress_notifications(&self, suppressed: bool) {
        self.notifications_suppressed
            .store(suppressed, Ordering::SeqCst);
    }
}

/// Fully wired supervisor around a scripted interpreter.
pub struct Harness {
    pub supervisor: ExecutionSupervisor,
    pub context: Arc<ExecutionContext>,
    pub lifecycle: Arc<VmLifecycle>,
    pub rendezvous: Arc<StdinRendezvous>,
    pub stream: Arc<StreamBuffer>,
    pub terminal: Arc<RecordingTerminal>,
    pub editor: Arc<RecordingEditor>,
    pub files: Arc<MemoryFiles>,
    pub feedback: Arc<RecordingFeedback>,
    pub vm: Arc<ScriptedVm>,
}

pub fn build_harness() -> Harness {
    build_harness_with_config(Config::default())
}

pub fn build_harness_with_config(config: Config) -> Harness {
    let terminal = Arc::new(RecordingTerminal::default());
    let editor = Arc::new(RecordingEditor::default());
    let files = MemoryFiles::with_main("");
    let feedback = Arc::new(RecordingFeedback::default());

    let rendezvous = Arc::new(StdinRendezvous::new(terminal.clone() as Arc<dyn TerminalSink>));
    let stream = Arc::new(StreamBuffer::new(terminal.clone() as Arc<dyn TerminalSink>));
    let callbacks = host_callbacks(stream.clone(), rendezvous.clone());

    let vm = ScriptedVm::new(callbacks.clone());
    let factory: VmFactory = Arc::new(|factory_callbacks| {
        Ok(ScriptedVm::new(factory_callbacks) as Arc<dyn RuntimeAdapter>)
    });
    let lifecycle = Arc::new(VmLifecycle::new(
        vm.clone() as Arc<dyn RuntimeAdapter>,
        factory,
        callbacks,
    ));

    let context = Arc::new(ExecutionContext::new());
    let host = HostHandles {
        editor: editor.clone() as Arc<dyn Editor>,
        files: files.clone() as Arc<dyn FileStore>,
        terminal: terminal.clone() as Arc<dyn TerminalSink>,
        feedback: feedback.clone() as Arc<dyn FeedbackEvaluator>,
    };
    let supervisor = ExecutionSupervisor::new(
        config,
        context.clone(),
        lifecycle.clone(),
        rendezvous.clone(),
        stream.clone(),
        host,
    );

    Harness {
        supervisor,
        context,
        lifecycle,
        rendezvous,
        stream,
        terminal,
        editor,
        files,
        feedback,
        vm,
    }
}
