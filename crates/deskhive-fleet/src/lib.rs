//! Fleet plumbing for deskhive: the remote-shell transport, the bounded
//! per-host connection pool, and the host orchestrator that places sessions
//! and tracks host health.

pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::FleetError;
pub use orchestrator::{HostOrchestrator, HostProbeOutcome, HostStatus};
pub use pool::{ConnectionPool, PoolCounts, PoolLimits};
pub use transport::{ExecOutput, ShellConnection, ShellEndpoint, ShellTransport, SshTransport};
