//! Fleet-wide placement and health tracking.
//!
//! The orchestrator owns one connection pool per host plus the per-host
//! runtime state (active-session count, healthy flag) under a single fleet
//! lock. Selection is greedy least-loaded among healthy hosts with a lexical
//! tiebreak; capacity itself is enforced by the pools.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use deskhive_core::config::{HostConfig, ServiceConfig};
use deskhive_events::{
    EventDraft, EventLevel, EventLog, EVENT_HOST_HEALTHY, EVENT_HOST_UNHEALTHY,
};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::FleetError;
use crate::pool::{ConnectionPool, PoolCounts, PoolLimits};
use crate::transport::{ShellConnection, ShellEndpoint, ShellTransport};

struct HostRuntime {
    active_sessions: usize,
    healthy: bool,
}

/// Admin snapshot of one host.
#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    pub hostname: String,
    pub public_hostname: String,
    pub healthy: bool,
    pub active_sessions: usize,
    pub pool: PoolCounts,
}

/// Result of probing one host's container runtime.
#[derive(Debug, Clone, Serialize)]
pub struct HostProbeOutcome {
    pub hostname: String,
    pub healthy: bool,
    pub detail: String,
}

/// Owns the fleet's pools, per-host concurrency counters, and health flags.
pub struct HostOrchestrator {
    hosts: Vec<HostConfig>,
    pools: HashMap<String, ConnectionPool>,
    state: Mutex<HashMap<String, HostRuntime>>,
    events: Arc<EventLog>,
}

impl HostOrchestrator {
    pub fn new(
        config: &ServiceConfig,
        transport: Arc<dyn ShellTransport>,
        events: Arc<EventLog>,
    ) -> Self {
        let limits = PoolLimits {
            max_connections: config.pool.max_connections_per_host,
            checkout_timeout: config.pool.checkout_timeout(),
        };
        let mut pools = HashMap::new();
        let mut state = HashMap::new();
        for host in &config.hosts {
            let endpoint = ShellEndpoint {
                hostname: host.hostname.clone(),
                user: config.ssh_user_for(host).to_string(),
            };
            pools.insert(
                host.hostname.clone(),
                ConnectionPool::new(endpoint, limits.clone(), transport.clone()),
            );
            state.insert(
                host.hostname.clone(),
                HostRuntime {
                    active_sessions: 0,
                    healthy: true,
                },
            );
        }
        info!("orchestrator initialized with {} hosts", config.hosts.len());
        Self {
            hosts: config.hosts.clone(),
            pools,
            state: Mutex::new(state),
            events,
        }
    }

    /// Picks the healthy host with the fewest active sessions, ties broken by
    /// hostname lexical order. Selection does not reserve capacity; callers
    /// reserve immediately afterwards.
    pub fn select_host(&self) -> Result<HostConfig, FleetError> {
        let state = lock_unpoisoned(&self.state);
        let mut best: Option<(&HostConfig, usize)> = None;
        for host in &self.hosts {
            let runtime = match state.get(&host.hostname) {
                Some(runtime) if runtime.healthy => runtime,
                _ => continue,
            };
            best = match best {
                None => Some((host, runtime.active_sessions)),
                Some((chosen, count)) => {
                    if runtime.active_sessions < count
                        || (runtime.active_sessions == count && host.hostname < chosen.hostname)
                    {
                        Some((host, runtime.active_sessions))
                    } else {
                        Some((chosen, count))
                    }
                }
            };
        }
        best.map(|(host, _)| host.clone())
            .ok_or(FleetError::NoHealthyHosts)
    }

    pub fn reserve_slot(&self, hostname: &str) {
        let mut state = lock_unpoisoned(&self.state);
        if let Some(runtime) = state.get_mut(hostname) {
            runtime.active_sessions = runtime.active_sessions.saturating_add(1);
            debug!(
                "reserved slot on {hostname}, now {} active sessions",
                runtime.active_sessions
            );
        }
    }

    pub fn release_slot(&self, hostname: &str) {
        let mut state = lock_unpoisoned(&self.state);
        if let Some(runtime) = state.get_mut(hostname) {
            runtime.active_sessions = runtime.active_sessions.saturating_sub(1);
            debug!(
                "released slot on {hostname}, now {} active sessions",
                runtime.active_sessions
            );
        }
    }

    pub fn active_sessions(&self, hostname: &str) -> usize {
        lock_unpoisoned(&self.state)
            .get(hostname)
            .map(|runtime| runtime.active_sessions)
            .unwrap_or(0)
    }

    pub fn is_healthy(&self, hostname: &str) -> bool {
        lock_unpoisoned(&self.state)
            .get(hostname)
            .map(|runtime| runtime.healthy)
            .unwrap_or(false)
    }

    pub async fn checkout_connection(
        &self,
        hostname: &str,
    ) -> Result<Box<dyn ShellConnection>, FleetError> {
        let pool = self.pools.get(hostname).ok_or_else(|| FleetError::UnknownHost {
            host: hostname.to_string(),
        })?;
        pool.checkout().await
    }

    pub async fn checkin_connection(&self, hostname: &str, conn: Box<dyn ShellConnection>) {
        match self.pools.get(hostname) {
            Some(pool) => pool.checkin(conn).await,
            None => {
                debug!("checkin for unknown host {hostname}; closing connection");
                conn.close().await;
            }
        }
    }

    /// Excludes the host from selection. Existing sessions on it are kept.
    pub fn mark_unhealthy(&self, hostname: &str, reason: &str) {
        if !self.set_health(hostname, false) {
            return;
        }
        warn!("host {hostname} marked unhealthy: {reason}");
        self.events.record(
            EventDraft::new(
                EVENT_HOST_UNHEALTHY,
                EventLevel::Warning,
                format!("host {hostname} marked unhealthy: {reason}"),
            )
            .with_metadata(json!({"hostname": hostname, "reason": reason})),
        );
    }

    /// Returns the host to the selectable set.
    pub fn mark_healthy(&self, hostname: &str) {
        if !self.set_health(hostname, true) {
            return;
        }
        info!("host {hostname} marked healthy");
        self.events.record(
            EventDraft::new(
                EVENT_HOST_HEALTHY,
                EventLevel::Info,
                format!("host {hostname} marked healthy"),
            )
            .with_metadata(json!({"hostname": hostname})),
        );
    }

    /// Verifies each host's container runtime over a pooled connection and
    /// sets health from the outcome. The only automatic path restoring an
    /// unhealthy host.
    pub async fn connectivity_probe(
        &self,
        probe_command: &str,
        command_timeout: Duration,
    ) -> Vec<HostProbeOutcome> {
        let mut report = Vec::with_capacity(self.hosts.len());
        for host in &self.hosts {
            match self.probe_host(&host.hostname, probe_command, command_timeout).await {
                Ok(detail) => {
                    self.mark_healthy(&host.hostname);
                    report.push(HostProbeOutcome {
                        hostname: host.hostname.clone(),
                        healthy: true,
                        detail,
                    });
                }
                Err(error) => {
                    let detail = error.to_string();
                    self.mark_unhealthy(&host.hostname, &detail);
                    report.push(HostProbeOutcome {
                        hostname: host.hostname.clone(),
                        healthy: false,
                        detail,
                    });
                }
            }
        }
        report
    }

    async fn probe_host(
        &self,
        hostname: &str,
        probe_command: &str,
        command_timeout: Duration,
    ) -> Result<String, FleetError> {
        let conn = self.checkout_connection(hostname).await?;
        let result = conn.exec(probe_command, command_timeout).await;
        self.checkin_connection(hostname, conn).await;
        let output = result?;
        if output.success() {
            Ok("container runtime reachable, image present".to_string())
        } else {
            Err(FleetError::RemoteCommandFailed {
                host: hostname.to_string(),
                detail: format!(
                    "probe exited {}: {}",
                    output.exit_code,
                    output.stderr.trim()
                ),
            })
        }
    }

    /// Admin snapshot across the fleet.
    pub fn host_status(&self) -> Vec<HostStatus> {
        let state = lock_unpoisoned(&self.state);
        self.hosts
            .iter()
            .map(|host| {
                let (active_sessions, healthy) = state
                    .get(&host.hostname)
                    .map(|runtime| (runtime.active_sessions, runtime.healthy))
                    .unwrap_or((0, false));
                let pool = self
                    .pools
                    .get(&host.hostname)
                    .map(|pool| pool.counts())
                    .unwrap_or(PoolCounts { open: 0, idle: 0 });
                HostStatus {
                    hostname: host.hostname.clone(),
                    public_hostname: host.public_hostname().to_string(),
                    healthy,
                    active_sessions,
                    pool,
                }
            })
            .collect()
    }

    /// Shutdown drain of every pool's idle connections.
    pub async fn close_all_pools(&self) {
        for pool in self.pools.values() {
            pool.close_all().await;
        }
        info!("all connection pools drained");
    }

    fn set_health(&self, hostname: &str, healthy: bool) -> bool {
        let mut state = lock_unpoisoned(&self.state);
        match state.get_mut(hostname) {
            Some(runtime) if runtime.healthy != healthy => {
                runtime.healthy = healthy;
                true
            }
            _ => false,
        }
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
