//! deskhived: the remote desktop session daemon.
//!
//! Wires the fleet orchestrator, session manager, and HTTP gateway together,
//! runs the expiry sweep and connectivity probe loops, and tears everything
//! down on SIGINT or SIGTERM.

mod bootstrap_helpers;
mod tasks;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use deskhive_core::{load_service_config, ServiceConfig};
use deskhive_events::EventLog;
use deskhive_fleet::{HostOrchestrator, ShellTransport, SshTransport};
use deskhive_gateway::{run_gateway_server, GatewayState};
use deskhive_session::{commands, SessionManager};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::bootstrap_helpers::init_tracing;
use crate::tasks::{spawn_connectivity_prober, spawn_session_sweeper};

/// Grace period for stopping remote containers on shutdown.
const SHUTDOWN_CLEANUP_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(
    name = "deskhived",
    about = "Places containerized desktops on a host fleet and serves the session API",
    version
)]
struct Cli {
    #[arg(
        long,
        env = "DESKHIVE_CONFIG",
        default_value = "deskhive.toml",
        help = "Path to the service configuration file"
    )]
    config: PathBuf,

    #[arg(
        long,
        env = "DESKHIVE_BIND",
        help = "Bind address override, e.g. 127.0.0.1:8089"
    )]
    bind: Option<String>,

    #[arg(long, help = "Skip the startup connectivity preflight")]
    skip_preflight: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run_daemon(cli).await
}

async fn run_daemon(cli: Cli) -> Result<()> {
    let config = load_service_config(&cli.config)?;
    info!("configuration loaded from {}", cli.config.display());
    let bind = cli.bind.unwrap_or_else(|| config.bind_addr.clone());
    let config = Arc::new(config);

    let events = Arc::new(EventLog::new());
    let transport: Arc<dyn ShellTransport> = Arc::new(SshTransport::new(&config.ssh));
    let fleet = Arc::new(HostOrchestrator::new(&config, transport, events.clone()));
    let sessions = Arc::new(SessionManager::new(
        config.clone(),
        fleet.clone(),
        events.clone(),
    ));

    if cli.skip_preflight {
        info!("startup preflight skipped");
    } else {
        run_startup_preflight(&config, &fleet).await;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = signal_tx.send(true);
    });

    let sweeper = spawn_session_sweeper(
        sessions.clone(),
        config.timeouts.cleanup_interval(),
        shutdown_rx.clone(),
    );
    let prober = config.timeouts.probe_interval().map(|interval| {
        spawn_connectivity_prober(config.clone(), fleet.clone(), interval, shutdown_rx.clone())
    });

    let state = Arc::new(GatewayState {
        config,
        sessions: sessions.clone(),
        fleet,
        events,
    });
    let mut gateway_shutdown = shutdown_rx;
    let serve_result = run_gateway_server(&bind, state, async move {
        let _ = gateway_shutdown.changed().await;
    })
    .await;

    // Stops the background loops even when the server exited on its own.
    let _ = shutdown_tx.send(true);
    let _ = sweeper.await;
    if let Some(handle) = prober {
        let _ = handle.await;
    }

    info!("stopping active sessions");
    if tokio::time::timeout(SHUTDOWN_CLEANUP_GRACE, sessions.cleanup_all())
        .await
        .is_err()
    {
        warn!(
            "session cleanup did not finish within {}s",
            SHUTDOWN_CLEANUP_GRACE.as_secs()
        );
    }
    info!("deskhived stopped");
    serve_result
}

/// One probe round before serving, so operators see dead hosts at startup
/// rather than on the first user request.
async fn run_startup_preflight(config: &ServiceConfig, fleet: &HostOrchestrator) {
    let command = commands::image_probe(&config.container_image);
    let report = fleet
        .connectivity_probe(&command, config.timeouts.quick_command())
        .await;
    let healthy = report.iter().filter(|outcome| outcome.healthy).count();
    for outcome in &report {
        if outcome.healthy {
            info!("host {} passed preflight", outcome.hostname);
        } else {
            warn!(
                "host {} failed preflight: {}",
                outcome.hostname, outcome.detail
            );
        }
    }
    if healthy == 0 {
        warn!("no hosts passed preflight; session creation will fail until a host recovers");
    }
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).ok();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
        _ = async {
            match sigterm.as_mut() {
                Some(stream) => {
                    stream.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        } => info!("termination signal received, shutting down"),
    }
}
