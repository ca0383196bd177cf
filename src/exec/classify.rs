use crate::transform::{NO_RUNNER_MARKER, TRACEBACK_MARKER};

/// Marker strings the interpreter emits for each failure family. Text
/// classification is the only contract the VM build gives us here.
const INTERRUPT_MARKERS: &[&str] = &["KeyboardInterrupt"];
const IO_INTERRUPTED_MARKERS: &[&str] = &[
    "I/O operation interrupted",
    "interrupted system call",
    "EINTR",
];
const CONCURRENCY_MARKERS: &[&str] = &[
    "coroutine already running",
    "async operation already in flight",
    "cannot schedule new futures",
];

/// Failure families recognized in guest-raised text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmFailure {
    /// Guest received an interrupt signal; a clean stop.
    Interrupt,
    /// A blocking read was interrupted underneath the guest; benign.
    IoInterrupted,
    /// The interpreter's async bookkeeping was left inconsistent by a
    /// prior interrupted run; recovery is attempted, never fatal.
    ConcurrencyConflict,
    /// The transform footer found no async runner; fatal to the run.
    Configuration,
    /// Ordinary guest exception with a traceback; goes through mapping.
    GuestTraceback,
    /// Anything else; reported and re-thrown.
    Other,
}

pub fn classify_raised(traceback: &str) -> VmFailure {
    if contains_any(traceback, INTERRUPT_MARKERS) {
        return VmFailure::Interrupt;
    }
    if contains_any(traceback, IO_INTERRUPTED_MARKERS) {
        return VmFailure::IoInterrupted;
    }
    if contains_any(traceback, CONCURRENCY_MARKERS) {
        return VmFailure::ConcurrencyConflict;
    }
    if traceback.contains(NO_RUNNER_MARKER) {
        return VmFailure::Configuration;
    }
    if traceback.contains(TRACEBACK_MARKER) {
        return VmFailure::GuestTraceback;
    }
    VmFailure::Other
}

fn contains_any(text: &str, markers: &[&str]) -> bool {
    markers.iter().any(|marker| text.contains(marker))
}
