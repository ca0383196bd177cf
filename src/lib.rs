pub mod config;
pub mod errors;
pub mod exec;
pub mod host;
pub mod io;
pub mod support;
pub mod transform;
pub mod vm;

#[cfg(test)]
pub(crate) mod testsupport;

pub use config::Config;
pub use errors::ExecError;
pub use exec::{ExecutionContext, ExecutionSupervisor, RunOutcome, RunSummary, host_callbacks};
pub use host::{HostHandles, RunRecord};
pub use io::{StdinRendezvous, StreamBuffer};
pub use transform::{TransformResult, transform, transform_with_trace};
pub use vm::{RuntimeAdapter, VmCapabilities, VmError, VmLifecycle};
