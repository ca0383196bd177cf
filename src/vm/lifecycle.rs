//==============================================
// File: vm/lifecycle.rs
// License: Duality Public License (DPL v1.0)
// Goal: Interpreter recovery state machine
// Objective: Soft reset, hard restart, and the interrupt primitive for
//            the single owned interpreter instance
//==============================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{HostCallbacks, RuntimeAdapter, VmError, VmFactory};
use crate::errors::ExecError;
use crate::support::poll_until;

/// Snapshot of the interpreter's virtual filesystem, captured before a
/// hard restart and replayed after the new instance is up. Transient.
pub type FilesystemSnapshot = BTreeMap<String, String>;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);
const READY_POLL_DEADLINE: Duration = Duration::from_secs(5);

/// System-level names preserved by the in-guest cleanup snippet.
const SYSTEM_ALLOW_LIST: &[&str] = &[
    "sys",
    "builtins",
    "asyncio",
    "types",
    "importlib",
    "tidepool_bridge",
    "__main__",
];

/// Conservative in-guest cleanup: drop user-defined top-level modules
/// and global bindings, keep the system allow-list. Bridge references
/// removed here are re-registered afterwards.
fn cleanup_snippet() -> String {
    let keep = SYSTEM_ALLOW_LIST
        .iter()
        .map(|name| format!("'{name}'"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "import sys as __tp_sys\n\
         __tp_keep = {{{keep}}}\n\
         for __tp_name in list(__tp_sys.modules):\n\
         \x20   __tp_root = __tp_name.split('.')[0]\n\
         \x20   if __tp_root not in __tp_keep and not __tp_root.startswith('_'):\n\
         \x20       del __tp_sys.modules[__tp_name]\n\
         __tp_globals = __tp_sys.modules['__main__'].__dict__\n\
         for __tp_name in list(__tp_globals):\n\
         \x20   if not __tp_name.startswith('__') and __tp_name not in __tp_keep:\n\
         \x20       del __tp_globals[__tp_name]\n"
    )
}

#[derive(Debug, Clone, Copy)]
pub struct ClearStateOptions {
    /// Escalate to a hard restart when the soft reset reports failure.
    pub fallback_to_restart: bool,
}

impl Default for ClearStateOptions {
    fn default() -> Self {
        Self {
            fallback_to_restart: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    SoftReset,
    HardRestart,
    Failed,
}

/// Owns the single interpreter instance and the two escalating recovery
/// strategies around it. Lifecycle operations mutate the instance only
/// between runs; the supervisor's single-flight guard enforces that.
pub struct VmLifecycle {
    slot: Mutex<Arc<dyn RuntimeAdapter>>,
    factory: VmFactory,
    callbacks: HostCallbacks,
}

impl VmLifecycle {
    pub fn new(
        adapter: Arc<dyn RuntimeAdapter>,
        factory: VmFactory,
        callbacks: HostCallbacks,
    ) -> Self {
        Self {
            slot: Mutex::new(adapter),
            factory,
            callbacks,
        }
    }

    pub fn adapter(&self) -> Arc<dyn RuntimeAdapter> {
        Arc::clone(&self.slot.lock())
    }

    /// Best-effort in-VM interrupt. Tries the cooperative-yielding path
    /// first, then the legacy scheduler interrupt. Reports whether any
    /// mechanism was delivered; never errors out.
    pub fn interrupt(&self) -> bool {
        let adapter = self.adapter();
        let caps = adapter.capabilities();

        if caps.supports_yielding
            && adapter.set_yielding(true).is_ok()
            && adapter.interrupt().is_ok()
        {
            tracing::debug!("interrupt_delivered mechanism=\"yielding\"");
            return true;
        }
        if caps.supports_interrupt && adapter.interrupt().is_ok() {
            tracing::debug!("interrupt_delivered mechanism=\"legacy\"");
            return true;
        }
        tracing::debug!("interrupt_unavailable");
        false
    }

    /// Clear the interpreter's async bookkeeping after an interrupted
    /// run left it inconsistent. Used by the concurrency-conflict
    /// recovery path. Best-effort.
    pub fn recover_async_state(&self) -> bool {
        let adapter = self.adapter();
        let cleared = step_ok("clear_interrupt", adapter.clear_interrupt());
        let reset = step_ok("reset_async_state", adapter.reset_async_state());
        let repl = step_ok("reinit_repl", adapter.reinit_repl());
        cleared && reset && repl
    }

    /// In-place state cleanup without destroying the interpreter.
    /// Every sub-step is independently best-effort; the return value
    /// reflects whether the essential steps (async bookkeeping reset,
    /// in-guest cleanup) took effect.
    pub async fn soft_reset(&self) -> bool {
        let adapter = self.adapter();

        step_ok("clear_interrupt", adapter.clear_interrupt());
        let async_ok = step_ok("reset_async_state", adapter.reset_async_state());
        step_ok("reinit_repl", adapter.reinit_repl());

        let cleanup_ok = match adapter.run(&cleanup_snippet()).await {
            Ok(()) => true,
            Err(VmError::Unsupported(_)) => true,
            Err(err) => {
                tracing::debug!("soft_reset_step step=\"cleanup_snippet\" err={err}");
                false
            }
        };

        // Interrupts must stay possible for the next run, and step 4
        // may have dropped the bridge references.
        step_ok("set_yielding", adapter.set_yielding(true));
        step_ok("register_bridge", adapter.register_bridge());

        async_ok && cleanup_ok
    }

    /// Last-resort recovery: snapshot the virtual filesystem, tear the
    /// interpreter down, build a fresh one, and replay the snapshot.
    pub async fn hard_restart(&self) -> Result<(), ExecError> {
        let old = self.adapter();
        let snapshot = snapshot_filesystem(old.as_ref());
        old.shutdown();

        let fresh = (self.factory)(self.callbacks.clone())
            .map_err(|err| ExecError::Internal(format!("interpreter construction failed: {err}")))?;

        let ready = poll_until(READY_POLL_INTERVAL, READY_POLL_DEADLINE, || {
            fresh.is_ready()
        })
        .await;
        if !ready {
            return Err(ExecError::Internal(
                "replacement interpreter never became ready".to_string(),
            ));
        }

        fresh.fs_suppress_notifications(true);
        for (path, content) in &snapshot {
            if let Some(parent) = parent_dir(path) {
                step_ok("replay_mkdirp", fresh.fs_mkdirp(parent));
            }
            step_ok("replay_write", fresh.fs_write(path, content));
        }
        fresh.fs_suppress_notifications(false);
        step_ok("register_bridge", fresh.register_bridge());

        *self.slot.lock() = fresh;
        tracing::debug!("hard_restart_complete files={}", snapshot.len());
        Ok(())
    }

    /// Public entry point used between runs: soft reset first, escalate
    /// to a hard restart only when that fails and the caller allows it.
    pub async fn clear_state(&self, opts: ClearStateOptions) -> RecoveryOutcome {
        if self.soft_reset().await {
            return RecoveryOutcome::SoftReset;
        }
        if !opts.fallback_to_restart {
            return RecoveryOutcome::Failed;
        }
        match self.hard_restart().await {
            Ok(()) => RecoveryOutcome::HardRestart,
            Err(err) => {
                tracing::debug!("hard_restart_failed err={err}");
                RecoveryOutcome::Failed
            }
        }
    }
}

fn step_ok(step: &'static str, result: Result<(), VmError>) -> bool {
    match result {
        Ok(()) => true,
        Err(VmError::Unsupported(_)) => true,
        Err(err) => {
            tracing::debug!("lifecycle_step_failed step={step} err={err}");
            false
        }
    }
}

/// Recursive best-effort walk of the interpreter filesystem. Files that
/// fail to read are skipped rather than aborting the snapshot.
fn snapshot_filesystem(adapter: &dyn RuntimeAdapter) -> FilesystemSnapshot {
    let mut snapshot = FilesystemSnapshot::new();
    let paths = match adapter.fs_list() {
        Ok(paths) => paths,
        Err(err) => {
            tracing::debug!("snapshot_list_failed err={err}");
            return snapshot;
        }
    };
    for path in paths {
        match adapter.fs_read(&path) {
            Ok(content) => {
                snapshot.insert(path, content);
            }
            Err(err) => {
                tracing::debug!("snapshot_read_failed path={path} err={err}");
            }
        }
    }
    snapshot
}

fn parent_dir(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    if idx == 0 { None } else { Some(&trimmed[..idx]) }
}
