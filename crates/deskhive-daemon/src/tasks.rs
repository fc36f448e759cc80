//! Background loops the daemon runs next to the gateway.

use std::sync::Arc;
use std::time::Duration;

use deskhive_core::ServiceConfig;
use deskhive_fleet::HostOrchestrator;
use deskhive_session::{commands, SessionManager};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// Periodically destroys sessions whose countdown has run out.
pub(crate) fn spawn_session_sweeper(
    sessions: Arc<SessionManager>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; nothing can be expired yet.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sessions.periodic_cleanup().await;
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Re-probes every host on a fixed cadence. This is the only path that
/// restores an unhealthy host without operator action.
pub(crate) fn spawn_connectivity_prober(
    config: Arc<ServiceConfig>,
    fleet: Arc<HostOrchestrator>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let command = commands::image_probe(&config.container_image);
        let timeout = config.timeouts.quick_command();
        let mut ticker = tokio::time::interval(interval);
        // Startup preflight already covered the immediate first tick.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = fleet.connectivity_probe(&command, timeout).await;
                    for outcome in report.iter().filter(|outcome| !outcome.healthy) {
                        warn!(
                            "host {} failed its connectivity probe: {}",
                            outcome.hostname, outcome.detail
                        );
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
