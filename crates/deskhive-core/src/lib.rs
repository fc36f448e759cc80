//! Foundational utilities shared across Deskhive crates.
//!
//! Provides time helpers, hostname display helpers, and the TOML
//! configuration model consumed by the daemon at startup.

pub mod config;
pub mod naming;
pub mod time_utils;

pub use config::{
    load_service_config, ContainerConfig, HostConfig, PoolConfig, ServiceConfig, SshConfig,
    TimeoutConfig, TimerConfig,
};
pub use naming::short_hostname;
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms};
