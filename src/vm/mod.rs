//==============================================
// File: vm/mod.rs
// License: Duality Public License (DPL v1.0)
// Goal: VM boundary for the execution core
// Objective: Adapter trait, capability flags, and host callback plumbing
//            around the embedded interpreter instance
//==============================================

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

pub mod lifecycle;


pub use lifecycle::{ClearStateOptions, FilesystemSnapshot, RecoveryOutcome, VmLifecycle};

/// Boxed future returned by adapter entry points, the same shape the
/// host uses for async builtins.
pub type VmFuture<'a> = Pin<Box<dyn Future<Output = Result<(), VmError>> + Send + 'a>>;

/// Boxed future produced by the stdin callback.
pub type InputFuture = Pin<Box<dyn Future<Output = String> + Send>>;

/// Failures surfaced across the adapter boundary. Guest tracebacks are
/// carried as raw text; classification happens in `exec`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VmError {
    #[error("guest raised: {traceback}")]
    Raised { traceback: String },
    #[error("guest interrupted")]
    Interrupted,
    #[error("operation not supported by this interpreter build: {0}")]
    Unsupported(&'static str),
    #[error("interpreter not ready")]
    NotReady,
    #[error("virtual filesystem error: {0}")]
    Filesystem(String),
    #[error("interpreter internal error: {0}")]
    Internal(String),
}

/// Capability flags computed once when an adapter is constructed,
/// replacing ad-hoc structural probing at call sites.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmCapabilities {
    pub supports_native_async: bool,
    pub supports_interrupt: bool,
    pub supports_yielding: bool,
}

/// Output and input hooks registered with the VM at construction time.
/// `stdout`/`stderr` fire once per emitted chunk in emission order;
/// `stdin` suspends the guest until the host supplies a line.
#[derive(Clone)]
pub struct HostCallbacks {
    pub stdout: Arc<dyn Fn(&str) + Send + Sync>,
    pub stderr: Arc<dyn Fn(&str) + Send + Sync>,
    pub stdin: Arc<dyn Fn(String) -> InputFuture + Send + Sync>,
}

/// Thin wrapper around one interpreter instance. Created once at
/// startup, replaced wholesale by `VmLifecycle::hard_restart`, never
/// partially mutated.
pub trait RuntimeAdapter: Send + Sync {
    fn capabilities(&self) -> VmCapabilities;

    /// Drive one program to completion. Resolves when the guest either
    /// finishes, raises, or unwinds from an interrupt.
    fn run<'a>(&'a self, code: &'a str) -> VmFuture<'a>;

    fn interrupt(&self) -> Result<(), VmError>;
    fn set_yielding(&self, enabled: bool) -> Result<(), VmError>;
    fn clear_interrupt(&self) -> Result<(), VmError>;

    /// Reset the interpreter's internal async bookkeeping after an
    /// interrupted run left it inconsistent.
    fn reset_async_state(&self) -> Result<(), VmError>;

    /// Re-initialize REPL-level state if the build exposes a hook.
    fn reinit_repl(&self) -> Result<(), VmError>;

    /// Re-register the host bridge modules (input bridge, filesystem
    /// notification bridge) inside the guest.
    fn register_bridge(&self) -> Result<(), VmError>;

    fn is_ready(&self) -> bool;

    /// Graceful termination hook invoked before the adapter is
    /// discarded. Best-effort.
    fn shutdown(&self);

    // Virtual filesystem surface.
    fn fs_read(&self, path: &str) -> Result<String, VmError>;
    fn fs_write(&self, path: &str, content: &str) -> Result<(), VmError>;
    fn fs_list(&self) -> Result<Vec<String>, VmError>;
    fn fs_mkdirp(&self, path: &str) -> Result<(), VmError>;
    fn fs_suppress_notifications(&self, suppressed: bool);
}

/// Factory used by hard restart to construct a replacement instance.
pub type VmFactory =
    Arc<dyn Fn(HostCallbacks) -> Result<Arc<dyn RuntimeAdapter>, VmError> + Send + Sync>;
