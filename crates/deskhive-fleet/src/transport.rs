//! Remote-shell transport seam.
//!
//! Production connections ride the system `ssh` binary with OpenSSH
//! connection multiplexing: each pooled connection owns a ControlMaster
//! process that holds the authenticated session, and every exec is a cheap
//! `ssh -S <socket>` client that reuses it. Tests substitute in-memory
//! implementations of the two traits.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use deskhive_core::config::SshConfig;
use deskhive_core::{current_unix_timestamp_ms, short_hostname};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::FleetError;

const MASTER_POLL_INTERVAL: Duration = Duration::from_millis(150);
const CONTROL_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

static CONTROL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Captured output of one remote command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Login target for one host, resolved from configuration.
#[derive(Debug, Clone)]
pub struct ShellEndpoint {
    pub hostname: String,
    pub user: String,
}

impl ShellEndpoint {
    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.hostname)
    }
}

/// Dials authenticated remote-shell connections.
#[async_trait]
pub trait ShellTransport: Send + Sync {
    async fn connect(&self, endpoint: &ShellEndpoint)
        -> Result<Box<dyn ShellConnection>, FleetError>;
}

/// One authenticated remote-shell handle; exactly one holder at a time.
#[async_trait]
pub trait ShellConnection: Send + Sync {
    fn hostname(&self) -> &str;

    /// Runs a command on the remote host within `timeout`.
    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, FleetError>;

    /// Liveness probe on the underlying transport.
    async fn is_alive(&self) -> bool;

    /// Tears the connection down; safe to call on an already-dead handle.
    async fn close(&self);
}

impl std::fmt::Debug for dyn ShellConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellConnection")
            .field("hostname", &self.hostname())
            .finish()
    }
}

/// `ShellTransport` backed by the system `ssh` binary.
///
/// Credential order follows the configuration: each listed identity file that
/// exists on disk is tried in turn, then a plain attempt falls back to the
/// ambient ssh-agent.
pub struct SshTransport {
    key_paths: Vec<PathBuf>,
    connect_timeout: Duration,
    control_dir: PathBuf,
}

impl SshTransport {
    pub fn new(config: &SshConfig) -> Self {
        let control_dir = std::env::temp_dir().join("deskhive-ssh");
        if let Err(error) = std::fs::create_dir_all(&control_dir) {
            warn!("could not create ssh control directory {}: {error}", control_dir.display());
        }
        Self {
            key_paths: config.key_paths.iter().map(|raw| expand_home(raw)).collect(),
            connect_timeout: config.connect_timeout(),
            control_dir,
        }
    }

    fn next_control_path(&self, endpoint: &ShellEndpoint) -> PathBuf {
        let id = CONTROL_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        // Host label is capped: control socket paths have a hard OS
        // length limit.
        let host: String = short_hostname(&endpoint.hostname).chars().take(16).collect();
        self.control_dir.join(format!(
            "dh-{host}-{}-{id}.sock",
            current_unix_timestamp_ms() % 1_000_000
        ))
    }

    async fn establish_master(
        &self,
        endpoint: &ShellEndpoint,
        identity: Option<&Path>,
    ) -> Option<SshConnection> {
        let control_path = self.next_control_path(endpoint);
        let mut command = Command::new("ssh");
        command
            .arg("-M")
            .arg("-N")
            .arg("-S")
            .arg(&control_path)
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg("-o")
            .arg("ServerAliveInterval=15")
            .arg("-o")
            .arg("ServerAliveCountMax=3");
        if let Some(identity) = identity {
            command
                .arg("-i")
                .arg(identity)
                .arg("-o")
                .arg("IdentitiesOnly=yes");
        }
        command
            .arg(endpoint.destination())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut master = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                warn!("failed to spawn ssh for {}: {error}", endpoint.hostname);
                return None;
            }
        };

        // The master goes to background work once authenticated; poll the
        // control socket until it answers or the process gives up.
        let deadline = std::time::Instant::now() + self.connect_timeout + Duration::from_secs(2);
        loop {
            if control_check(&control_path, endpoint).await {
                match identity {
                    Some(identity) => debug!(
                        "ssh master to {} ready via {}",
                        endpoint.hostname,
                        identity.display()
                    ),
                    None => debug!("ssh master to {} ready via agent", endpoint.hostname),
                }
                return Some(SshConnection {
                    endpoint: endpoint.clone(),
                    control_path,
                    master: Mutex::new(Some(master)),
                });
            }
            match master.try_wait() {
                Ok(Some(_)) | Err(_) => break,
                Ok(None) => {}
            }
            if std::time::Instant::now() >= deadline {
                let _ = master.kill().await;
                break;
            }
            tokio::time::sleep(MASTER_POLL_INTERVAL).await;
        }
        let _ = std::fs::remove_file(&control_path);
        None
    }
}

#[async_trait]
impl ShellTransport for SshTransport {
    async fn connect(
        &self,
        endpoint: &ShellEndpoint,
    ) -> Result<Box<dyn ShellConnection>, FleetError> {
        for key_path in &self.key_paths {
            if !key_path.exists() {
                continue;
            }
            if let Some(connection) = self.establish_master(endpoint, Some(key_path)).await {
                return Ok(Box::new(connection));
            }
        }
        if let Some(connection) = self.establish_master(endpoint, None).await {
            return Ok(Box::new(connection));
        }
        Err(FleetError::AuthenticationFailed {
            host: endpoint.hostname.clone(),
        })
    }
}

/// One multiplexed SSH connection; owns its ControlMaster process.
pub struct SshConnection {
    endpoint: ShellEndpoint,
    control_path: PathBuf,
    master: Mutex<Option<tokio::process::Child>>,
}

impl SshConnection {
    fn client_command(&self) -> Command {
        let mut command = Command::new("ssh");
        command
            .arg("-S")
            .arg(&self.control_path)
            .arg("-o")
            .arg("BatchMode=yes")
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl ShellConnection for SshConnection {
    fn hostname(&self) -> &str {
        &self.endpoint.hostname
    }

    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, FleetError> {
        let mut client = self.client_command();
        client.arg(self.endpoint.destination()).arg(command);
        let output = tokio::time::timeout(timeout, client.output())
            .await
            .map_err(|_| FleetError::RemoteCommandFailed {
                host: self.endpoint.hostname.clone(),
                detail: format!("command timed out after {}s", timeout.as_secs()),
            })?
            .map_err(|error| FleetError::RemoteCommandFailed {
                host: self.endpoint.hostname.clone(),
                detail: error.to_string(),
            })?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn is_alive(&self) -> bool {
        control_check(&self.control_path, &self.endpoint).await
    }

    async fn close(&self) {
        let mut exit = self.client_command();
        exit.arg("-O").arg("exit").arg(self.endpoint.destination());
        let _ = tokio::time::timeout(CONTROL_CHECK_TIMEOUT, exit.output()).await;

        if let Some(mut master) = self.master.lock().await.take() {
            let _ = master.kill().await;
        }
        let _ = std::fs::remove_file(&self.control_path);
    }
}

/// Asks the ControlMaster whether it still holds a live session.
async fn control_check(control_path: &Path, endpoint: &ShellEndpoint) -> bool {
    let mut command = Command::new("ssh");
    command
        .arg("-S")
        .arg(control_path)
        .arg("-O")
        .arg("check")
        .arg("-o")
        .arg("BatchMode=yes")
        .arg(endpoint.destination())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true);
    matches!(
        tokio::time::timeout(CONTROL_CHECK_TIMEOUT, command.status()).await,
        Ok(Ok(status)) if status.success()
    )
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(raw)
}
