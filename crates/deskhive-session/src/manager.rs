//! Session lifecycle state machine.
//!
//! One user owns at most one desktop session. Creation runs as a background
//! task that walks the container through host selection, startup, port
//! discovery, and a readiness wait, narrating progress into a status map the
//! gateway polls. Established sessions live in a record map guarded by a
//! single lock together with their countdown timers; every failure path puts
//! borrowed fleet capacity back where it came from.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use deskhive_core::config::{HostConfig, ServiceConfig};
use deskhive_core::{current_unix_timestamp, current_unix_timestamp_ms, short_hostname};
use deskhive_events::{
    EventDraft, EventLevel, EventLog, EVENT_SESSION_CREATED, EVENT_SESSION_DESTROYED,
    EVENT_SESSION_ERROR, EVENT_SESSION_EXPIRED, EVENT_SESSION_EXTENDED, EVENT_SESSION_REQUESTED,
};
use deskhive_fleet::{FleetError, HostOrchestrator, ShellConnection};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::commands;
use crate::error::SessionError;
use crate::probe::ReadinessProbe;
use crate::timer::{ExtendOutcome, SessionTimer, TimerView};

/// Caller identity resolved at the trust boundary.
#[derive(Debug, Clone)]
pub struct SessionUser {
    pub id: u64,
    pub username: String,
}

/// Where an in-flight creation currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CreationPhase {
    Queued,
    SelectingHost,
    Connecting,
    StartingContainer,
    GettingPorts,
    WaitingVnc,
    Ready,
    Failed,
}

impl CreationPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::SelectingHost => "selecting_host",
            Self::Connecting => "connecting",
            Self::StartingContainer => "starting_container",
            Self::GettingPorts => "getting_ports",
            Self::WaitingVnc => "waiting_vnc",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    /// Terminal phases permit a new creation attempt.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

/// Progress snapshot the gateway serves while a desktop is being prepared.
#[derive(Debug, Clone, Serialize)]
pub struct CreationStatus {
    pub phase: CreationPhase,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An established session: one container on one fleet host.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub container_id: String,
    pub container_name: String,
    pub hostname: String,
    pub public_hostname: String,
    pub username: String,
    pub vnc_port: u16,
    pub web_port: u16,
    pub created_unix_ms: u64,
}

/// User-facing view of an established session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub created_unix_ms: u64,
    pub public_hostname: String,
    pub vnc_port: u16,
    pub web_port: u16,
    pub timer: TimerView,
}

impl SessionView {
    fn from_record(record: &SessionRecord, timer: TimerView) -> Self {
        Self {
            created_unix_ms: record.created_unix_ms,
            public_hostname: record.public_hostname.clone(),
            vnc_port: record.vnc_port,
            web_port: record.web_port,
            timer,
        }
    }
}

/// Admin listing entry joining a record with its timer.
#[derive(Debug, Clone, Serialize)]
pub struct AdminSessionView {
    pub user_id: u64,
    #[serde(flatten)]
    pub record: SessionRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timer: Option<TimerView>,
}

#[derive(Default)]
struct ManagerState {
    records: HashMap<u64, SessionRecord>,
    timers: HashMap<u64, SessionTimer>,
    creation: HashMap<u64, CreationStatus>,
}

struct ProvisionedContainer {
    id: String,
    name: String,
    vnc_port: u16,
    web_port: u16,
}

/// Owns every session record and drives creation, expiry, and teardown.
pub struct SessionManager {
    config: Arc<ServiceConfig>,
    fleet: Arc<HostOrchestrator>,
    events: Arc<EventLog>,
    probe: ReadinessProbe,
    state: Mutex<ManagerState>,
}

impl SessionManager {
    pub fn new(
        config: Arc<ServiceConfig>,
        fleet: Arc<HostOrchestrator>,
        events: Arc<EventLog>,
    ) -> Self {
        let probe = ReadinessProbe::new(&config.timeouts);
        Self {
            config,
            fleet,
            events,
            probe,
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Accepts a creation request and spawns the provisioning task. Rejected
    /// when the user already has a session or a non-terminal creation.
    pub fn create(self: &Arc<Self>, user: SessionUser) -> Result<(), SessionError> {
        {
            let mut state = lock_unpoisoned(&self.state);
            if state.records.contains_key(&user.id) {
                return Err(SessionError::AlreadyExists { user: user.id });
            }
            if let Some(status) = state.creation.get(&user.id) {
                if !status.phase.is_terminal() {
                    return Err(SessionError::AlreadyExists { user: user.id });
                }
            }
            state.creation.insert(
                user.id,
                CreationStatus {
                    phase: CreationPhase::Queued,
                    message: "Queued...".to_string(),
                    hostname: None,
                    error: None,
                },
            );
        }
        info!(
            "session creation queued for user {} ({})",
            user.id, user.username
        );
        self.events.record(EventDraft::for_user(
            EVENT_SESSION_REQUESTED,
            EventLevel::Info,
            "requested a desktop session",
            user.id,
            &user.username,
        ));
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_creation(user).await;
        });
        Ok(())
    }

    async fn run_creation(self: Arc<Self>, user: SessionUser) {
        self.set_creation_status(user.id, CreationPhase::SelectingHost, "Choosing a server...");
        let host = match self.fleet.select_host() {
            Ok(host) => host,
            Err(error) => {
                self.finish_failed(&user, None, error.into());
                return;
            }
        };
        self.fleet.reserve_slot(&host.hostname);
        if let Err(error) = self.provision_on_host(&user, &host).await {
            // Undo the placement and pull the host from selection until the
            // next connectivity probe clears it.
            self.fleet.release_slot(&host.hostname);
            self.fleet.mark_unhealthy(&host.hostname, &error.to_string());
            self.finish_failed(&user, Some(&host.hostname), error);
        }
    }

    async fn provision_on_host(
        &self,
        user: &SessionUser,
        host: &HostConfig,
    ) -> Result<(), SessionError> {
        let hostname = host.hostname.as_str();
        let display = short_hostname(hostname);

        self.set_creation_status(
            user.id,
            CreationPhase::Connecting,
            format!("Connecting to {display}..."),
        );
        let conn = self.fleet.checkout_connection(hostname).await?;

        // The connection goes back to the pool on success and failure alike;
        // the readiness wait below must not hold it.
        let provisioned = self.start_and_discover(user, host, conn.as_ref()).await;
        self.fleet.checkin_connection(hostname, conn).await;
        let provisioned = provisioned?;

        self.set_creation_status(
            user.id,
            CreationPhase::WaitingVnc,
            format!("Waiting for the display server on {display}..."),
        );
        if !self
            .probe
            .wait_until_ready(hostname, provisioned.web_port)
            .await
        {
            return Err(SessionError::ReadinessTimeout {
                container: provisioned.name,
            });
        }

        let record = SessionRecord {
            container_id: provisioned.id,
            container_name: provisioned.name,
            hostname: hostname.to_string(),
            public_hostname: host.public_hostname().to_string(),
            username: user.username.clone(),
            vnc_port: provisioned.vnc_port,
            web_port: provisioned.web_port,
            created_unix_ms: current_unix_timestamp_ms(),
        };
        {
            let mut state = lock_unpoisoned(&self.state);
            state.records.insert(user.id, record.clone());
            state.timers.insert(
                user.id,
                SessionTimer::fresh(self.config.sessions.max_extensions),
            );
            state.creation.insert(
                user.id,
                CreationStatus {
                    phase: CreationPhase::Ready,
                    message: "Desktop ready!".to_string(),
                    hostname: Some(display.to_string()),
                    error: None,
                },
            );
        }
        info!(
            "session ready for user {} on {hostname}: container {} vnc {} web {}",
            user.id, record.container_name, record.vnc_port, record.web_port
        );
        self.events.record(
            EventDraft::for_user(
                EVENT_SESSION_CREATED,
                EventLevel::Info,
                format!("desktop session ready on {display}"),
                user.id,
                &user.username,
            )
            .with_metadata(json!({
                "hostname": record.hostname,
                "container_name": record.container_name,
                "vnc_port": record.vnc_port,
                "web_port": record.web_port,
            })),
        );
        Ok(())
    }

    async fn start_and_discover(
        &self,
        user: &SessionUser,
        host: &HostConfig,
        conn: &dyn ShellConnection,
    ) -> Result<ProvisionedContainer, SessionError> {
        let display = short_hostname(&host.hostname);
        self.set_creation_status(
            user.id,
            CreationPhase::StartingContainer,
            format!("Starting your desktop on {display}..."),
        );

        let name = commands::container_name(user.id, current_unix_timestamp());
        let start = commands::start_container(
            &name,
            &self.config.container_image,
            &self.config.container,
        );
        let output = conn
            .exec(&start, self.config.timeouts.remote_command())
            .await?;
        if !output.success() {
            return Err(FleetError::RemoteCommandFailed {
                host: host.hostname.clone(),
                detail: format!(
                    "docker run exited {}: {}",
                    output.exit_code,
                    first_line(&output.stderr)
                ),
            }
            .into());
        }
        let id = output.stdout.trim().to_string();
        debug!("container {name} started with id {id}");

        self.set_creation_status(
            user.id,
            CreationPhase::GettingPorts,
            format!("Desktop starting on {display}, discovering ports..."),
        );
        let attempts = self.config.timeouts.port_mapping_attempts.max(1);
        let mut mappings = commands::PortMappings::default();
        for attempt in 1..=attempts {
            let output = conn
                .exec(
                    &commands::port_mappings(&name),
                    self.config.timeouts.quick_command(),
                )
                .await?;
            mappings = commands::parse_port_mappings(&output.stdout);
            if mappings.complete().is_some() {
                break;
            }
            debug!("port mappings for {name} incomplete on attempt {attempt}");
            if attempt < attempts {
                tokio::time::sleep(self.config.timeouts.port_mapping_delay()).await;
            }
        }
        let Some((vnc_port, web_port)) = mappings.complete() else {
            return Err(SessionError::PortDiscoveryFailed { container: name });
        };

        Ok(ProvisionedContainer {
            id,
            name,
            vnc_port,
            web_port,
        })
    }

    fn set_creation_status(&self, user_id: u64, phase: CreationPhase, message: impl Into<String>) {
        let message = message.into();
        debug!(
            "creation status for user {user_id}: {} ({message})",
            phase.as_str()
        );
        let mut state = lock_unpoisoned(&self.state);
        state.creation.insert(
            user_id,
            CreationStatus {
                phase,
                message,
                hostname: None,
                error: None,
            },
        );
    }

    fn finish_failed(&self, user: &SessionUser, hostname: Option<&str>, error: SessionError) {
        let message = error.to_string();
        error!("session creation failed for user {}: {message}", user.id);
        {
            let mut state = lock_unpoisoned(&self.state);
            state.creation.insert(
                user.id,
                CreationStatus {
                    phase: CreationPhase::Failed,
                    message: message.clone(),
                    hostname: hostname.map(|hostname| short_hostname(hostname).to_string()),
                    error: Some(message.clone()),
                },
            );
        }
        let mut metadata = json!({ "error": message });
        if let Some(hostname) = hostname {
            metadata["hostname"] = json!(hostname);
        }
        self.events.record(
            EventDraft::for_user(
                EVENT_SESSION_ERROR,
                EventLevel::Error,
                format!("desktop session creation failed: {message}"),
                user.id,
                &user.username,
            )
            .with_metadata(metadata),
        );
    }

    /// Tears a session down. Bookkeeping is cleared before the remote stop so
    /// the user-visible state is "no session" even when the host is
    /// unreachable; a concurrent destroy resolves to `NotFound`.
    pub async fn destroy(&self, user_id: u64) -> Result<(), SessionError> {
        let record = {
            let mut state = lock_unpoisoned(&self.state);
            let Some(record) = state.records.remove(&user_id) else {
                return Err(SessionError::NotFound { user: user_id });
            };
            state.timers.remove(&user_id);
            state.creation.remove(&user_id);
            record
        };
        info!(
            "destroying session {} for user {user_id} on {}",
            record.container_name, record.hostname
        );

        let stop_result = self.stop_remote_container(&record).await;
        self.fleet.release_slot(&record.hostname);

        self.events.record(
            EventDraft::for_user(
                EVENT_SESSION_DESTROYED,
                EventLevel::Info,
                "desktop session destroyed",
                user_id,
                &record.username,
            )
            .with_metadata(json!({
                "hostname": record.hostname,
                "container_name": record.container_name,
                "stop_failed": stop_result.is_err(),
            })),
        );
        stop_result
    }

    async fn stop_remote_container(&self, record: &SessionRecord) -> Result<(), SessionError> {
        let conn = match self.fleet.checkout_connection(&record.hostname).await {
            Ok(conn) => conn,
            Err(error) => {
                warn!(
                    "could not reach {} to stop {}: {error}",
                    record.hostname, record.container_name
                );
                return Err(error.into());
            }
        };
        let result = conn
            .exec(
                &commands::stop_container(&record.container_name),
                self.config.timeouts.quick_command(),
            )
            .await;
        self.fleet.checkin_connection(&record.hostname, conn).await;
        match result {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => {
                let stderr = output.stderr.trim();
                // The image runs with --rm, so a crashed container may
                // already be gone when we come to stop it.
                if stderr.contains("No such container") {
                    debug!("container {} already gone", record.container_name);
                    return Ok(());
                }
                warn!(
                    "stop of {} exited {}: {stderr}",
                    record.container_name, output.exit_code
                );
                Err(FleetError::RemoteCommandFailed {
                    host: record.hostname.clone(),
                    detail: format!("docker stop exited {}", output.exit_code),
                }
                .into())
            }
            Err(error) => {
                warn!("stop of {} failed: {error}", record.container_name);
                Err(error.into())
            }
        }
    }

    /// Current session for a user. Starts the countdown on first read and
    /// destroys the session when the countdown has run out.
    pub async fn session_status(&self, user_id: u64) -> Option<SessionView> {
        let now = current_unix_timestamp_ms();
        let mut expired = false;
        let view = {
            let mut state = lock_unpoisoned(&self.state);
            let ManagerState {
                records, timers, ..
            } = &mut *state;
            let record = records.get(&user_id)?;
            let timer = timers.get_mut(&user_id)?;
            if timer.is_expired(now) {
                expired = true;
                None
            } else {
                if timer.start(now, self.config.sessions.initial_duration_ms()) {
                    debug!("session timer started for user {user_id} on first status read");
                }
                Some(SessionView::from_record(record, timer.view(now)))
            }
        };
        if expired {
            info!("session for user {user_id} expired, destroying on status read");
            if let Err(error) = self.destroy(user_id).await {
                warn!("destroy of expired session for user {user_id} failed: {error}");
            }
            return None;
        }
        view
    }

    pub fn creation_status(&self, user_id: u64) -> Option<CreationStatus> {
        lock_unpoisoned(&self.state).creation.get(&user_id).cloned()
    }

    /// Public host plus web and VNC ports for proxy auth checks. Does not
    /// touch the countdown.
    pub fn connect_target(&self, user_id: u64) -> Option<(String, u16, u16)> {
        let state = lock_unpoisoned(&self.state);
        state.records.get(&user_id).map(|record| {
            (
                record.public_hostname.clone(),
                record.web_port,
                record.vnc_port,
            )
        })
    }

    /// Starts the countdown if it is not running; returns the view either way.
    pub fn start_timer(&self, user_id: u64) -> Result<TimerView, SessionError> {
        let now = current_unix_timestamp_ms();
        let mut state = lock_unpoisoned(&self.state);
        let Some(timer) = state.timers.get_mut(&user_id) else {
            return Err(SessionError::NotFound { user: user_id });
        };
        if timer.start(now, self.config.sessions.initial_duration_ms()) {
            debug!("session timer started for user {user_id}");
        }
        Ok(timer.view(now))
    }

    pub fn stop_timer(&self, user_id: u64) -> Result<(), SessionError> {
        let mut state = lock_unpoisoned(&self.state);
        let Some(timer) = state.timers.get_mut(&user_id) else {
            return Err(SessionError::NotFound { user: user_id });
        };
        timer.stop();
        Ok(())
    }

    /// Grants one extension on top of the time left right now.
    pub fn extend_timer(&self, user_id: u64) -> Result<TimerView, SessionError> {
        let now = current_unix_timestamp_ms();
        let extension_ms = self.config.sessions.extension_ms();
        let (view, username) = {
            let mut state = lock_unpoisoned(&self.state);
            let ManagerState {
                records, timers, ..
            } = &mut *state;
            let Some(timer) = timers.get_mut(&user_id) else {
                return Err(SessionError::NotFound { user: user_id });
            };
            match timer.extend(now, extension_ms) {
                ExtendOutcome::NotStarted => {
                    return Err(SessionError::TimerNotStarted { user: user_id })
                }
                ExtendOutcome::LimitReached => {
                    return Err(SessionError::ExtensionLimitReached { user: user_id })
                }
                ExtendOutcome::Extended => {}
            }
            let username = records
                .get(&user_id)
                .map(|record| record.username.clone())
                .unwrap_or_default();
            (timer.view(now), username)
        };
        self.events.record(
            EventDraft::for_user(
                EVENT_SESSION_EXTENDED,
                EventLevel::Info,
                format!(
                    "session extended ({}/{} extensions used)",
                    view.extensions_used, view.max_extensions
                ),
                user_id,
                &username,
            )
            .with_metadata(json!({
                "extensions_used": view.extensions_used,
                "max_extensions": view.max_extensions,
                "extension_seconds": self.config.sessions.extension_seconds,
            })),
        );
        Ok(view)
    }

    pub fn timer_status(&self, user_id: u64) -> Result<TimerView, SessionError> {
        let now = current_unix_timestamp_ms();
        let state = lock_unpoisoned(&self.state);
        state
            .timers
            .get(&user_id)
            .map(|timer| timer.view(now))
            .ok_or(SessionError::NotFound { user: user_id })
    }

    /// Every established session, oldest first, for the admin dashboard.
    pub fn all_sessions(&self) -> Vec<AdminSessionView> {
        let now = current_unix_timestamp_ms();
        let state = lock_unpoisoned(&self.state);
        let mut sessions: Vec<AdminSessionView> = state
            .records
            .iter()
            .map(|(user_id, record)| AdminSessionView {
                user_id: *user_id,
                record: record.clone(),
                timer: state.timers.get(user_id).map(|timer| timer.view(now)),
            })
            .collect();
        sessions.sort_by_key(|session| session.record.created_unix_ms);
        sessions
    }

    /// One sweep of the expiry reaper. Returns how many sessions it removed.
    pub async fn periodic_cleanup(&self) -> usize {
        let now = current_unix_timestamp_ms();
        let expired: Vec<(u64, String)> = {
            let state = lock_unpoisoned(&self.state);
            state
                .timers
                .iter()
                .filter(|(_, timer)| timer.is_expired(now))
                .map(|(user_id, _)| {
                    let username = state
                        .records
                        .get(user_id)
                        .map(|record| record.username.clone())
                        .unwrap_or_default();
                    (*user_id, username)
                })
                .collect()
        };

        let mut removed = 0;
        for (user_id, username) in expired {
            self.events.record(EventDraft::for_user(
                EVENT_SESSION_EXPIRED,
                EventLevel::Warning,
                "session time expired, cleaning up",
                user_id,
                &username,
            ));
            match self.destroy(user_id).await {
                Ok(()) => removed += 1,
                // Destroyed concurrently between the snapshot and here.
                Err(SessionError::NotFound { .. }) => {}
                Err(error) => {
                    // Bookkeeping is already cleared; only the remote stop failed.
                    warn!("cleanup of expired session for user {user_id} failed: {error}");
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!("expired-session sweep removed {removed} session(s)");
        }
        removed
    }

    /// Shutdown teardown: stops every container best-effort, clears all
    /// bookkeeping, and drains the connection pools. Safe to call twice.
    pub async fn cleanup_all(&self) {
        let records: Vec<SessionRecord> = {
            let mut state = lock_unpoisoned(&self.state);
            state.timers.clear();
            state.creation.clear();
            state.records.drain().map(|(_, record)| record).collect()
        };
        if !records.is_empty() {
            info!(
                "shutdown cleanup stopping {} session container(s)",
                records.len()
            );
        }
        for record in records {
            if let Err(error) = self.stop_remote_container(&record).await {
                warn!("shutdown stop of {} failed: {error}", record.container_name);
            }
            self.fleet.release_slot(&record.hostname);
        }
        self.fleet.close_all_pools().await;
        info!("session cleanup complete");
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("").trim()
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests;
