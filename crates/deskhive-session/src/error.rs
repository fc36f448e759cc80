use deskhive_fleet::FleetError;
use thiserror::Error;

/// Errors surfaced by session lifecycle operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The user already has a session record or an in-flight creation.
    #[error("a session already exists for user {user}")]
    AlreadyExists { user: u64 },
    /// No session record exists for the user.
    #[error("no active session for user {user}")]
    NotFound { user: u64 },
    /// The session timer has not been started yet.
    #[error("session timer not started for user {user}")]
    TimerNotStarted { user: u64 },
    /// The timer has already consumed every allowed extension.
    #[error("maximum session extensions reached for user {user}")]
    ExtensionLimitReached { user: u64 },
    /// The container runtime never reported both published ports.
    #[error("could not discover published ports for container {container}")]
    PortDiscoveryFailed { container: String },
    /// The display server inside the container never answered HTTP.
    #[error("display server for container {container} did not become ready in time")]
    ReadinessTimeout { container: String },
    #[error(transparent)]
    Fleet(#[from] FleetError),
}
