//! TOML configuration model for the deskhive daemon.
//!
//! Every field carries a serde default so a minimal file (a bind address and a
//! host list) is a valid configuration. The loaded structure is immutable for
//! the life of the process.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level daemon configuration, loaded once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Listen address for the HTTP gateway.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Container image every desktop session runs.
    #[serde(default = "default_container_image")]
    pub container_image: String,
    /// Fleet host descriptors; immutable for process lifetime.
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub sessions: TimerConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// One fleet host: internal address for SSH, public address for user traffic.
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    pub hostname: String,
    /// Hostname handed to browsers/proxies; defaults to `hostname`.
    #[serde(default)]
    pub public_hostname: Option<String>,
    /// SSH login user; defaults to `ssh.user`.
    #[serde(default)]
    pub user: Option<String>,
}

impl HostConfig {
    pub fn public_hostname(&self) -> &str {
        self.public_hostname.as_deref().unwrap_or(&self.hostname)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// Default login user for hosts that do not set their own.
    #[serde(default = "default_ssh_user")]
    pub user: String,
    /// Identity files tried in order before falling back to the agent.
    #[serde(default = "default_key_paths")]
    pub key_paths: Vec<String>,
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            key_paths: default_key_paths(),
            connect_timeout_seconds: default_connect_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections_per_host")]
    pub max_connections_per_host: usize,
    /// Bounded wait for a free pooled connection before `PoolExhausted`.
    #[serde(default = "default_checkout_timeout_seconds")]
    pub checkout_timeout_seconds: u64,
}

impl PoolConfig {
    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_secs(self.checkout_timeout_seconds)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_host: default_max_connections_per_host(),
            checkout_timeout_seconds: default_checkout_timeout_seconds(),
        }
    }
}

/// Resource limits and display settings applied to every session container.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerConfig {
    #[serde(default = "default_resolution")]
    pub resolution: String,
    #[serde(default = "default_vnc_password")]
    pub vnc_password: String,
    #[serde(default = "default_shm_size")]
    pub shm_size: String,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            resolution: default_resolution(),
            vnc_password: default_vnc_password(),
            shm_size: default_shm_size(),
            memory_limit: default_memory_limit(),
            cpu_limit: default_cpu_limit(),
        }
    }
}

/// Session countdown defaults: initial horizon, extension increment, cap.
#[derive(Debug, Clone, Deserialize)]
pub struct TimerConfig {
    #[serde(default = "default_initial_duration_seconds")]
    pub initial_duration_seconds: u64,
    #[serde(default = "default_extension_seconds")]
    pub extension_seconds: u64,
    #[serde(default = "default_max_extensions")]
    pub max_extensions: u32,
}

impl TimerConfig {
    pub fn initial_duration_ms(&self) -> u64 {
        self.initial_duration_seconds.saturating_mul(1_000)
    }

    pub fn extension_ms(&self) -> u64 {
        self.extension_seconds.saturating_mul(1_000)
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            initial_duration_seconds: default_initial_duration_seconds(),
            extension_seconds: default_extension_seconds(),
            max_extensions: default_max_extensions(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    /// Remote command budget for container starts.
    #[serde(default = "default_remote_command_seconds")]
    pub remote_command_seconds: u64,
    /// Remote command budget for quick queries (port lookups, stops).
    #[serde(default = "default_quick_command_seconds")]
    pub quick_command_seconds: u64,
    /// Per-attempt budget for the HTTP readiness probe.
    #[serde(default = "default_probe_request_seconds")]
    pub probe_request_seconds: u64,
    #[serde(default = "default_readiness_attempts")]
    pub readiness_attempts: u32,
    #[serde(default = "default_readiness_delay_ms")]
    pub readiness_delay_ms: u64,
    #[serde(default = "default_port_mapping_attempts")]
    pub port_mapping_attempts: u32,
    #[serde(default = "default_port_mapping_delay_ms")]
    pub port_mapping_delay_ms: u64,
    /// Cadence of the expired-session sweeper.
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
    /// Cadence of the fleet connectivity probe; zero disables it.
    #[serde(default = "default_probe_interval_seconds")]
    pub probe_interval_seconds: u64,
}

impl TimeoutConfig {
    pub fn remote_command(&self) -> Duration {
        Duration::from_secs(self.remote_command_seconds)
    }

    pub fn quick_command(&self) -> Duration {
        Duration::from_secs(self.quick_command_seconds)
    }

    pub fn probe_request(&self) -> Duration {
        Duration::from_secs(self.probe_request_seconds)
    }

    pub fn readiness_delay(&self) -> Duration {
        Duration::from_millis(self.readiness_delay_ms)
    }

    pub fn port_mapping_delay(&self) -> Duration {
        Duration::from_millis(self.port_mapping_delay_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    pub fn probe_interval(&self) -> Option<Duration> {
        if self.probe_interval_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.probe_interval_seconds))
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            remote_command_seconds: default_remote_command_seconds(),
            quick_command_seconds: default_quick_command_seconds(),
            probe_request_seconds: default_probe_request_seconds(),
            readiness_attempts: default_readiness_attempts(),
            readiness_delay_ms: default_readiness_delay_ms(),
            port_mapping_attempts: default_port_mapping_attempts(),
            port_mapping_delay_ms: default_port_mapping_delay_ms(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
            probe_interval_seconds: default_probe_interval_seconds(),
        }
    }
}

impl ServiceConfig {
    /// Resolves the SSH login user for one host.
    pub fn ssh_user_for<'a>(&'a self, host: &'a HostConfig) -> &'a str {
        host.user.as_deref().unwrap_or(&self.ssh.user)
    }

    fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            bail!("configuration lists no fleet hosts");
        }
        let mut seen = std::collections::BTreeSet::new();
        for host in &self.hosts {
            if host.hostname.trim().is_empty() {
                bail!("fleet host with empty hostname");
            }
            if !seen.insert(host.hostname.as_str()) {
                bail!("duplicate fleet host {}", host.hostname);
            }
        }
        if self.pool.max_connections_per_host == 0 {
            bail!("pool.max_connections_per_host must be at least 1");
        }
        // The expiry sweeper ticker rejects a zero period; only the probe
        // interval has zero-disables semantics.
        if self.timeouts.cleanup_interval_seconds == 0 {
            bail!("timeouts.cleanup_interval_seconds must be at least 1");
        }
        if self.container_image.trim().is_empty() {
            bail!("container_image must be non-empty");
        }
        Ok(())
    }
}

/// Reads and validates the daemon configuration from a TOML file.
pub fn load_service_config(path: &Path) -> Result<ServiceConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: ServiceConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn default_bind_addr() -> String {
    "127.0.0.1:8400".to_string()
}

fn default_container_image() -> String {
    "deskhive/desktop:latest".to_string()
}

fn default_ssh_user() -> String {
    "desktop".to_string()
}

fn default_key_paths() -> Vec<String> {
    vec![
        "/root/.ssh/id_ed25519".to_string(),
        "/root/.ssh/id_rsa".to_string(),
        "~/.ssh/id_ed25519".to_string(),
        "~/.ssh/id_rsa".to_string(),
    ]
}

fn default_connect_timeout_seconds() -> u64 {
    15
}

fn default_max_connections_per_host() -> usize {
    5
}

fn default_checkout_timeout_seconds() -> u64 {
    60
}

fn default_resolution() -> String {
    "1920x1080".to_string()
}

fn default_vnc_password() -> String {
    "deskhive".to_string()
}

fn default_shm_size() -> String {
    "2g".to_string()
}

fn default_memory_limit() -> String {
    "4g".to_string()
}

fn default_cpu_limit() -> String {
    "2".to_string()
}

fn default_initial_duration_seconds() -> u64 {
    3_600
}

fn default_extension_seconds() -> u64 {
    1_800
}

fn default_max_extensions() -> u32 {
    3
}

fn default_remote_command_seconds() -> u64 {
    30
}

fn default_quick_command_seconds() -> u64 {
    10
}

fn default_probe_request_seconds() -> u64 {
    3
}

fn default_readiness_attempts() -> u32 {
    60
}

fn default_readiness_delay_ms() -> u64 {
    500
}

fn default_port_mapping_attempts() -> u32 {
    5
}

fn default_port_mapping_delay_ms() -> u64 {
    300
}

fn default_cleanup_interval_seconds() -> u64 {
    60
}

fn default_probe_interval_seconds() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const MINIMAL: &str = r#"
container_image = "fleet/desktop:2"

[[hosts]]
hostname = "node-a.fleet.internal"
public_hostname = "node-a.example.com"

[[hosts]]
hostname = "node-b.fleet.internal"
user = "operator"
"#;

    #[test]
    fn unit_minimal_config_fills_defaults() {
        let config: ServiceConfig = toml::from_str(MINIMAL).expect("parse");
        assert_eq!(config.bind_addr, "127.0.0.1:8400");
        assert_eq!(config.container_image, "fleet/desktop:2");
        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.hosts[0].public_hostname(), "node-a.example.com");
        assert_eq!(config.hosts[1].public_hostname(), "node-b.fleet.internal");
        assert_eq!(config.ssh_user_for(&config.hosts[0]), "desktop");
        assert_eq!(config.ssh_user_for(&config.hosts[1]), "operator");
        assert_eq!(config.pool.max_connections_per_host, 5);
        assert_eq!(config.pool.checkout_timeout(), Duration::from_secs(60));
        assert_eq!(config.sessions.initial_duration_ms(), 3_600_000);
        assert_eq!(config.timeouts.readiness_attempts, 60);
        assert_eq!(config.timeouts.probe_interval(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn unit_zero_probe_interval_disables_prober() {
        let mut config: ServiceConfig = toml::from_str(MINIMAL).expect("parse");
        config.timeouts.probe_interval_seconds = 0;
        assert_eq!(config.timeouts.probe_interval(), None);
    }

    #[test]
    fn unit_validation_rejects_empty_fleet_and_duplicates() {
        let empty: ServiceConfig = toml::from_str("").expect("parse");
        assert!(empty.validate().is_err());

        let duplicated = r#"
[[hosts]]
hostname = "node-a"
[[hosts]]
hostname = "node-a"
"#;
        let config: ServiceConfig = toml::from_str(duplicated).expect("parse");
        let error = config.validate().expect_err("duplicate hosts");
        assert!(error.to_string().contains("duplicate"));
    }

    #[test]
    fn unit_validation_rejects_zero_cleanup_interval() {
        let mut config: ServiceConfig = toml::from_str(MINIMAL).expect("parse");
        config.timeouts.cleanup_interval_seconds = 0;
        let error = config.validate().expect_err("zero sweep interval");
        assert!(error.to_string().contains("cleanup_interval_seconds"));
    }

    #[test]
    fn functional_load_service_config_reads_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("deskhive.toml");
        let mut file = std::fs::File::create(&path).expect("create");
        file.write_all(MINIMAL.as_bytes()).expect("write");

        let config = load_service_config(&path).expect("load");
        assert_eq!(config.hosts[0].hostname, "node-a.fleet.internal");

        let missing = load_service_config(&dir.path().join("absent.toml"));
        assert!(missing.is_err());
    }
}
