use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use deskhive_core::config::{
    ContainerConfig, PoolConfig, SshConfig, TimeoutConfig, TimerConfig,
};
use deskhive_fleet::{ExecOutput, ShellEndpoint, ShellTransport};
use httpmock::prelude::*;

use super::*;

#[derive(Default)]
struct Script {
    fail_run: AtomicBool,
    stop_stderr: Mutex<Option<String>>,
    port_outputs: Mutex<VecDeque<String>>,
    executed: Mutex<Vec<String>>,
}

/// Transport whose connections answer `docker` commands from a script.
#[derive(Default)]
struct ScriptedTransport {
    dials: AtomicUsize,
    refuse_connect: AtomicBool,
    script: Arc<Script>,
}

impl ScriptedTransport {
    fn push_port_output(&self, output: impl Into<String>) {
        self.script
            .port_outputs
            .lock()
            .expect("lock")
            .push_back(output.into());
    }

    fn executed(&self) -> Vec<String> {
        self.script.executed.lock().expect("lock").clone()
    }

    fn fail_run(&self) {
        self.script.fail_run.store(true, Ordering::SeqCst);
    }

    fn fail_stop(&self, stderr: impl Into<String>) {
        *self.script.stop_stderr.lock().expect("lock") = Some(stderr.into());
    }

    fn refuse_connections(&self) {
        self.refuse_connect.store(true, Ordering::SeqCst);
    }
}

struct ScriptedConnection {
    hostname: String,
    script: Arc<Script>,
}

#[async_trait]
impl ShellTransport for ScriptedTransport {
    async fn connect(
        &self,
        endpoint: &ShellEndpoint,
    ) -> Result<Box<dyn ShellConnection>, FleetError> {
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(FleetError::AuthenticationFailed {
                host: endpoint.hostname.clone(),
            });
        }
        self.dials.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedConnection {
            hostname: endpoint.hostname.clone(),
            script: self.script.clone(),
        }))
    }
}

#[async_trait]
impl ShellConnection for ScriptedConnection {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn exec(&self, command: &str, _timeout: Duration) -> Result<ExecOutput, FleetError> {
        self.script
            .executed
            .lock()
            .expect("lock")
            .push(command.to_string());
        if command.starts_with("docker run") {
            if self.script.fail_run.load(Ordering::SeqCst) {
                return Ok(ExecOutput {
                    stdout: String::new(),
                    stderr: "docker: image boot failure".to_string(),
                    exit_code: 125,
                });
            }
            return Ok(ExecOutput {
                stdout: "c0ffee1234abcd\n".to_string(),
                stderr: String::new(),
                exit_code: 0,
            });
        }
        if command.starts_with("docker port") {
            let output = self
                .script
                .port_outputs
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_default();
            return Ok(ExecOutput {
                stdout: output,
                stderr: String::new(),
                exit_code: 0,
            });
        }
        if command.starts_with("docker stop") {
            if let Some(stderr) = self.script.stop_stderr.lock().expect("lock").clone() {
                return Ok(ExecOutput {
                    stdout: String::new(),
                    stderr,
                    exit_code: 1,
                });
            }
            return Ok(ExecOutput::default());
        }
        Ok(ExecOutput {
            stdout: "ok\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn is_alive(&self) -> bool {
        true
    }

    async fn close(&self) {}
}

fn test_config(hostname: &str) -> ServiceConfig {
    ServiceConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        container_image: "deskhive/desktop:latest".to_string(),
        hosts: vec![HostConfig {
            hostname: hostname.to_string(),
            public_hostname: Some("desk.example.com".to_string()),
            user: None,
        }],
        ssh: SshConfig::default(),
        pool: PoolConfig {
            max_connections_per_host: 5,
            checkout_timeout_seconds: 1,
        },
        container: ContainerConfig::default(),
        sessions: TimerConfig {
            initial_duration_seconds: 3_600,
            extension_seconds: 1_800,
            max_extensions: 2,
        },
        timeouts: TimeoutConfig {
            remote_command_seconds: 5,
            quick_command_seconds: 5,
            probe_request_seconds: 1,
            readiness_attempts: 2,
            readiness_delay_ms: 10,
            port_mapping_attempts: 2,
            port_mapping_delay_ms: 10,
            cleanup_interval_seconds: 60,
            probe_interval_seconds: 0,
        },
    }
}

struct Fixture {
    manager: Arc<SessionManager>,
    fleet: Arc<HostOrchestrator>,
    events: Arc<EventLog>,
    transport: Arc<ScriptedTransport>,
    server: MockServer,
}

fn fixture_customized(tweak: impl FnOnce(&mut ServiceConfig)) -> Fixture {
    let server = MockServer::start();
    let mut config = test_config(&server.host());
    tweak(&mut config);
    let config = Arc::new(config);
    let transport = Arc::new(ScriptedTransport::default());
    let events = Arc::new(EventLog::new());
    let fleet = Arc::new(HostOrchestrator::new(
        &config,
        transport.clone(),
        events.clone(),
    ));
    let manager = Arc::new(SessionManager::new(config, fleet.clone(), events.clone()));
    Fixture {
        manager,
        fleet,
        events,
        transport,
        server,
    }
}

fn fixture() -> Fixture {
    fixture_customized(|_| {})
}

fn user(id: u64, username: &str) -> SessionUser {
    SessionUser {
        id,
        username: username.to_string(),
    }
}

fn event_kinds(events: &EventLog) -> Vec<String> {
    events
        .recent(0)
        .iter()
        .map(|event| event.kind.clone())
        .collect()
}

/// Runs the creation sequence to completion for one user, with the display
/// server answering 200 and the runtime reporting ports on the first query.
async fn provision_ready(fixture: &Fixture, user_id: u64, username: &str) {
    fixture.server.mock(|when, then| {
        when.method(GET).path("/");
        then.status(200);
    });
    fixture.transport.push_port_output(format!(
        "5900/tcp -> 0.0.0.0:45900\n6080/tcp -> 0.0.0.0:{}\n",
        fixture.server.port()
    ));
    fixture
        .manager
        .clone()
        .run_creation(user(user_id, username))
        .await;
    let status = fixture
        .manager
        .creation_status(user_id)
        .expect("creation status");
    assert_eq!(status.phase, CreationPhase::Ready);
}

fn force_expire(manager: &SessionManager, user_id: u64) {
    let mut state = lock_unpoisoned(&manager.state);
    if let Some(timer) = state.timers.get_mut(&user_id) {
        timer.start(current_unix_timestamp_ms().saturating_sub(10_000), 1_000);
    }
}

async fn wait_for_terminal(manager: &Arc<SessionManager>, user_id: u64) {
    for _ in 0..200 {
        if let Some(status) = manager.creation_status(user_id) {
            if status.phase.is_terminal() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("creation for user {user_id} never reached a terminal phase");
}

#[tokio::test]
async fn functional_creation_provisions_ready_session() {
    let fixture = fixture();
    provision_ready(&fixture, 7, "alice").await;

    let view = fixture
        .manager
        .session_status(7)
        .await
        .expect("session view");
    assert_eq!(view.public_hostname, "desk.example.com");
    assert_eq!(view.vnc_port, 45900);
    assert_eq!(view.web_port, fixture.server.port());
    assert!(view.timer.active);
    assert_eq!(view.timer.extensions_used, 0);

    assert_eq!(fixture.fleet.active_sessions(&fixture.server.host()), 1);

    let executed = fixture.transport.executed();
    assert!(executed[0].starts_with("docker run -d --rm --name desk-7-"));
    assert!(executed[0].contains("deskhive/desktop:latest"));
    assert!(executed
        .iter()
        .any(|command| command.starts_with("docker port desk-7-")));

    assert!(event_kinds(&fixture.events).contains(&EVENT_SESSION_CREATED.to_string()));

    let error = fixture
        .manager
        .create(user(7, "alice"))
        .expect_err("record already exists");
    assert!(matches!(error, SessionError::AlreadyExists { user: 7 }));
}

#[tokio::test]
async fn functional_readiness_timeout_fails_creation_and_downgrades_host() {
    let fixture = fixture();
    fixture.server.mock(|when, then| {
        when.method(GET).path("/");
        then.status(503);
    });
    fixture.transport.push_port_output(format!(
        "5900/tcp -> 0.0.0.0:45900\n6080/tcp -> 0.0.0.0:{}\n",
        fixture.server.port()
    ));

    fixture.manager.clone().run_creation(user(7, "alice")).await;

    let status = fixture.manager.creation_status(7).expect("creation status");
    assert_eq!(status.phase, CreationPhase::Failed);
    assert!(status
        .error
        .expect("error detail")
        .contains("did not become ready"));

    assert!(fixture.manager.session_status(7).await.is_none());
    assert_eq!(fixture.fleet.active_sessions(&fixture.server.host()), 0);
    assert!(!fixture.fleet.is_healthy(&fixture.server.host()));
    assert!(event_kinds(&fixture.events).contains(&EVENT_SESSION_ERROR.to_string()));
}

#[tokio::test]
async fn functional_start_failure_releases_slot_and_reports() {
    let fixture = fixture();
    fixture.transport.fail_run();

    fixture.manager.clone().run_creation(user(3, "bob")).await;

    let status = fixture.manager.creation_status(3).expect("creation status");
    assert_eq!(status.phase, CreationPhase::Failed);
    assert!(status.message.contains("docker run exited 125"));
    assert_eq!(fixture.fleet.active_sessions(&fixture.server.host()), 0);
    assert!(!fixture.fleet.is_healthy(&fixture.server.host()));

    // The connection used for the failed start went back to the pool.
    let status = fixture.fleet.host_status();
    assert_eq!(status[0].pool.idle, 1);
}

#[tokio::test]
async fn functional_port_discovery_failure_fails_creation() {
    let fixture = fixture();
    // No scripted port output: every query comes back empty.
    fixture.manager.clone().run_creation(user(4, "cara")).await;

    let status = fixture.manager.creation_status(4).expect("creation status");
    assert_eq!(status.phase, CreationPhase::Failed);
    assert!(status.message.contains("could not discover published ports"));

    let executed = fixture.transport.executed();
    let port_queries = executed
        .iter()
        .filter(|command| command.starts_with("docker port"))
        .count();
    assert_eq!(port_queries, 2);
}

#[tokio::test]
async fn functional_create_rejects_concurrent_attempts_and_allows_retry_after_failure() {
    let fixture = fixture_customized(|config| {
        config.timeouts.port_mapping_attempts = 5;
        config.timeouts.port_mapping_delay_ms = 100;
    });

    fixture
        .manager
        .create(user(9, "dave"))
        .expect("first create accepted");
    let error = fixture
        .manager
        .create(user(9, "dave"))
        .expect_err("second create rejected while in flight");
    assert!(matches!(error, SessionError::AlreadyExists { user: 9 }));

    wait_for_terminal(&fixture.manager, 9).await;
    let status = fixture.manager.creation_status(9).expect("creation status");
    assert_eq!(status.phase, CreationPhase::Failed);

    // A terminal failure clears the way for another attempt.
    fixture
        .manager
        .create(user(9, "dave"))
        .expect("retry accepted");
    wait_for_terminal(&fixture.manager, 9).await;
}

#[tokio::test]
async fn functional_destroy_stops_container_and_clears_state() {
    let fixture = fixture();
    provision_ready(&fixture, 7, "alice").await;

    fixture.manager.destroy(7).await.expect("destroy");

    assert!(fixture.manager.session_status(7).await.is_none());
    assert!(fixture.manager.creation_status(7).is_none());
    assert_eq!(fixture.fleet.active_sessions(&fixture.server.host()), 0);

    let executed = fixture.transport.executed();
    assert!(executed
        .iter()
        .any(|command| command.starts_with("docker stop desk-7-")));
    assert!(event_kinds(&fixture.events).contains(&EVENT_SESSION_DESTROYED.to_string()));

    let error = fixture.manager.destroy(7).await.expect_err("second destroy");
    assert!(matches!(error, SessionError::NotFound { user: 7 }));
}

#[tokio::test]
async fn functional_destroy_clears_state_even_when_host_unreachable() {
    let fixture = fixture();
    provision_ready(&fixture, 7, "alice").await;

    // Drain the pooled connection, then refuse new dials.
    fixture.fleet.close_all_pools().await;
    fixture.transport.refuse_connections();

    let error = fixture
        .manager
        .destroy(7)
        .await
        .expect_err("remote stop unreachable");
    assert!(matches!(error, SessionError::Fleet(_)));

    assert!(fixture.manager.session_status(7).await.is_none());
    assert_eq!(fixture.fleet.active_sessions(&fixture.server.host()), 0);
    assert!(event_kinds(&fixture.events).contains(&EVENT_SESSION_DESTROYED.to_string()));
}

#[tokio::test]
async fn functional_destroy_reports_stop_failure_but_clears_state() {
    let fixture = fixture();
    provision_ready(&fixture, 7, "alice").await;
    fixture
        .transport
        .fail_stop("Error response from daemon: cannot stop container");

    let error = fixture.manager.destroy(7).await.expect_err("stop failed");
    match error {
        SessionError::Fleet(FleetError::RemoteCommandFailed { detail, .. }) => {
            assert!(detail.contains("docker stop exited 1"), "detail: {detail}");
        }
        other => panic!("unexpected error {other:?}"),
    }

    // The record, timer, and slot are gone despite the failed stop.
    assert!(fixture.manager.session_status(7).await.is_none());
    assert!(fixture.manager.creation_status(7).is_none());
    assert_eq!(fixture.fleet.active_sessions(&fixture.server.host()), 0);

    let destroyed = fixture
        .events
        .recent(0)
        .into_iter()
        .find(|event| event.kind == EVENT_SESSION_DESTROYED)
        .expect("destroy event");
    assert_eq!(destroyed.metadata["stop_failed"], true);
}

#[tokio::test]
async fn regression_destroy_tolerates_already_removed_container() {
    let fixture = fixture();
    provision_ready(&fixture, 7, "alice").await;
    // The image runs with --rm: a crashed container is gone before the
    // stop command reaches the host.
    fixture
        .transport
        .fail_stop("Error response from daemon: No such container: desk-7-1");

    fixture.manager.destroy(7).await.expect("destroy succeeds");

    assert!(fixture.manager.session_status(7).await.is_none());
    assert_eq!(fixture.fleet.active_sessions(&fixture.server.host()), 0);
}

#[tokio::test]
async fn unit_extend_requires_started_timer() {
    let fixture = fixture();
    provision_ready(&fixture, 7, "alice").await;

    let error = fixture.manager.extend_timer(7).expect_err("not started");
    assert!(matches!(error, SessionError::TimerNotStarted { user: 7 }));
}

#[tokio::test]
async fn unit_timer_start_stop_and_status() {
    let fixture = fixture();
    provision_ready(&fixture, 7, "alice").await;

    let status = fixture.manager.timer_status(7).expect("fresh status");
    assert!(!status.active);
    assert_eq!(status.time_remaining_seconds, 0);

    let started = fixture.manager.start_timer(7).expect("start");
    assert!(started.active);
    assert!(started.time_remaining_seconds > 3_500);
    // Starting again does not rewind the countdown.
    let again = fixture.manager.start_timer(7).expect("second start");
    assert!(again.time_remaining_seconds <= started.time_remaining_seconds);

    fixture.manager.stop_timer(7).expect("stop");
    let status = fixture.manager.timer_status(7).expect("stopped status");
    assert!(!status.active);
    assert!(!status.expired);

    let error = fixture.manager.start_timer(99).expect_err("no session");
    assert!(matches!(error, SessionError::NotFound { user: 99 }));
    let error = fixture.manager.stop_timer(99).expect_err("no session");
    assert!(matches!(error, SessionError::NotFound { user: 99 }));
}

#[tokio::test]
async fn functional_extend_timer_enforces_cap_and_records_events() {
    let fixture = fixture();
    provision_ready(&fixture, 7, "alice").await;

    // First status read starts the countdown.
    let view = fixture.manager.session_status(7).await.expect("view");
    assert!(view.timer.active);

    let extended = fixture.manager.extend_timer(7).expect("first extension");
    assert_eq!(extended.extensions_used, 1);
    let extended = fixture.manager.extend_timer(7).expect("second extension");
    assert_eq!(extended.extensions_used, 2);

    let error = fixture.manager.extend_timer(7).expect_err("cap reached");
    assert!(matches!(error, SessionError::ExtensionLimitReached { user: 7 }));

    let extended_events = fixture
        .events
        .recent(0)
        .iter()
        .filter(|event| event.kind == EVENT_SESSION_EXTENDED)
        .count();
    assert_eq!(extended_events, 2);

    let error = fixture.manager.extend_timer(99).expect_err("no session");
    assert!(matches!(error, SessionError::NotFound { user: 99 }));
}

#[tokio::test]
async fn functional_periodic_cleanup_destroys_expired_sessions() {
    let fixture = fixture();
    provision_ready(&fixture, 7, "alice").await;
    provision_ready(&fixture, 8, "bob").await;
    force_expire(&fixture.manager, 7);

    let removed = fixture.manager.periodic_cleanup().await;
    assert_eq!(removed, 1);

    assert!(fixture.manager.session_status(7).await.is_none());
    assert!(fixture.manager.session_status(8).await.is_some());
    assert_eq!(fixture.fleet.active_sessions(&fixture.server.host()), 1);
    assert!(event_kinds(&fixture.events).contains(&EVENT_SESSION_EXPIRED.to_string()));
}

#[tokio::test]
async fn functional_status_read_destroys_expired_session() {
    let fixture = fixture();
    provision_ready(&fixture, 7, "alice").await;
    force_expire(&fixture.manager, 7);

    assert!(fixture.manager.session_status(7).await.is_none());
    assert!(fixture.manager.creation_status(7).is_none());

    let executed = fixture.transport.executed();
    assert!(executed
        .iter()
        .any(|command| command.starts_with("docker stop desk-7-")));
}

#[tokio::test]
async fn functional_cleanup_all_drains_sessions_and_pools() {
    let fixture = fixture();
    provision_ready(&fixture, 7, "alice").await;
    provision_ready(&fixture, 8, "bob").await;

    fixture.manager.cleanup_all().await;

    assert!(fixture.manager.all_sessions().is_empty());
    assert_eq!(fixture.fleet.active_sessions(&fixture.server.host()), 0);

    let stops = fixture
        .transport
        .executed()
        .iter()
        .filter(|command| command.starts_with("docker stop"))
        .count();
    assert_eq!(stops, 2);

    let status = fixture.fleet.host_status();
    assert_eq!(status[0].pool.open, 0);
}

#[tokio::test]
async fn unit_admin_views_expose_sessions_and_connect_targets() {
    let fixture = fixture();
    provision_ready(&fixture, 7, "alice").await;

    let sessions = fixture.manager.all_sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].user_id, 7);
    assert_eq!(sessions[0].record.username, "alice");
    assert!(sessions[0].record.container_name.starts_with("desk-7-"));
    assert!(sessions[0]
        .timer
        .as_ref()
        .is_some_and(|timer| !timer.active));

    let (host, web_port, vnc_port) = fixture.manager.connect_target(7).expect("target");
    assert_eq!(host, "desk.example.com");
    assert_eq!(web_port, fixture.server.port());
    assert_eq!(vnc_port, 45900);
    assert!(fixture.manager.connect_target(99).is_none());
}

#[tokio::test]
async fn regression_status_reads_do_not_restart_the_countdown() {
    let fixture = fixture();
    provision_ready(&fixture, 7, "alice").await;

    let first = fixture.manager.session_status(7).await.expect("first read");
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let second = fixture
        .manager
        .session_status(7)
        .await
        .expect("second read");
    assert!(second.timer.time_remaining_seconds < first.timer.time_remaining_seconds);
}
