use thiserror::Error;

use crate::vm::VmError;

/// Stable codes attached to user-facing run notices and log events.
/// Recoverable families (timeouts, cancellations, interrupts) never
/// escape the supervisor as errors; the code still tags their notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Timeout,
    SafetyStall,
    Cancelled,
    Interrupted,
    IoInterrupted,
    ConcurrencyConflict,
    GuestRuntime,
    Configuration,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Timeout => "E101",
            ErrorCode::SafetyStall => "E102",
            ErrorCode::Cancelled => "E103",
            ErrorCode::Interrupted => "E104",
            ErrorCode::IoInterrupted => "E105",
            ErrorCode::ConcurrencyConflict => "E106",
            ErrorCode::GuestRuntime => "E107",
            ErrorCode::Configuration => "E108",
            ErrorCode::Internal => "E109",
        }
    }
}

/// Errors re-thrown past `ExecutionSupervisor::run`. Everything the
/// supervisor can classify and recover from is folded into the returned
/// `RunSummary` instead.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Vm(#[from] VmError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ExecError::Configuration(_) => ErrorCode::Configuration,
            ExecError::Vm(_) => ErrorCode::GuestRuntime,
            ExecError::Internal(_) => ErrorCode::Internal,
        }
    }
}
