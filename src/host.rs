//==============================================
// File: host.rs
// License: Duality Public License (DPL v1.0)
// Goal: Collaborator seams for the execution core
// Objective: Narrow trait contracts for the editor, file store, terminal
//            renderer, and feedback evaluator surrounding a run
//==============================================

use std::sync::Arc;

use serde::Serialize;

/// Classification of a line rendered into the terminal widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    Stdout,
    Stderr,
    RuntimeNotice,
    StdinEcho,
    Debug,
}

impl OutputKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputKind::Stdout => "stdout",
            OutputKind::Stderr => "stderr",
            OutputKind::RuntimeNotice => "runtime-notice",
            OutputKind::StdinEcho => "stdin-echo",
            OutputKind::Debug => "debug",
        }
    }
}

/// Editor widget contract: content, highlights, read-only toggling.
pub trait Editor: Send + Sync {
    fn set_content(&self, path: &str, text: &str) -> anyhow::Result<()>;
    fn highlight_line(&self, path: &str, line: usize);
    fn clear_highlights(&self);
    fn set_read_only(&self, read_only: bool);
}

/// Workspace file store (tab manager / persistent storage facade).
pub trait FileStore: Send + Sync {
    fn read(&self, path: &str) -> Option<String>;
    fn write(&self, path: &str, content: &str) -> anyhow::Result<()>;
    fn list(&self) -> Vec<String>;
    fn delete(&self, path: &str) -> anyhow::Result<()>;
}

/// Terminal renderer contract. `remove_lines_containing` exists for the
/// stderr replacement protocol, which retracts already-rendered raw
/// frames once a mapped diagnostic is available; `scrape` feeds the
/// lowest-priority fallback of the feedback payload.
pub trait TerminalSink: Send + Sync {
    fn append(&self, text: &str, kind: OutputKind);
    fn set_input_enabled(&self, enabled: bool, prompt: &str);
    fn remove_lines_containing(&self, needle: &str);
    fn scrape(&self, kind: OutputKind) -> String;
}

/// Payload handed to the feedback/grading evaluator after every run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunRecord {
    pub stdout: String,
    pub stderr: String,
    pub stdin: String,
    pub filenames: Vec<String>,
}

impl RunRecord {
    /// JSON form handed to out-of-process evaluators.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Fire-and-forget run observer. Implementations must not assume they
/// are called from any particular phase; errors are swallowed upstream.
pub trait FeedbackEvaluator: Send + Sync {
    fn evaluate_run(&self, record: &RunRecord);
}

/// No-op evaluator for hosts that do not wire up grading.
pub struct NullFeedback;

impl FeedbackEvaluator for NullFeedback {
    fn evaluate_run(&self, _record: &RunRecord) {}
}

/// Shared handle bundle threaded through the execution components.
#[derive(Clone)]
pub struct HostHandles {
    pub editor: Arc<dyn Editor>,
    pub files: Arc<dyn FileStore>,
    pub terminal: Arc<dyn TerminalSink>,
    pub feedback: Arc<dyn FeedbackEvaluator>,
}
