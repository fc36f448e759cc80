//! Desktop session lifecycle for the deskhive daemon.
//!
//! Covers the full arc of a session: provisioning a desktop container on a
//! fleet host, discovering its published ports, waiting for the display
//! server, running the countdown timer, and tearing everything down on
//! destroy, expiry, or shutdown.

pub mod commands;
pub mod error;
pub mod manager;
pub mod probe;
pub mod timer;

pub use error::SessionError;
pub use manager::{
    AdminSessionView, CreationPhase, CreationStatus, SessionManager, SessionRecord, SessionUser,
    SessionView,
};
pub use probe::ReadinessProbe;
pub use timer::{SessionTimer, TimerView};
