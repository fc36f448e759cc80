use thiserror::Error;

/// Failures surfaced by the connection pool and host orchestrator.
#[derive(Debug, Error)]
pub enum FleetError {
    /// No credential source could authenticate to the host.
    #[error("could not authenticate to {host}")]
    AuthenticationFailed { host: String },
    /// Checkout waited the full bounded timeout without a free connection.
    #[error("connection pool for {host} is exhausted")]
    PoolExhausted { host: String },
    #[error("no connection pool for host {host}")]
    UnknownHost { host: String },
    #[error("no healthy hosts available")]
    NoHealthyHosts,
    /// Transport error, timeout, or non-zero exit running a remote command.
    #[error("remote command on {host} failed: {detail}")]
    RemoteCommandFailed { host: String, detail: String },
}
