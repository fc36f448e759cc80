//! HTTP readiness probe for the browser display server.
//!
//! A container is only handed to the user once the web client inside it
//! answers `GET /` with 200. Containers take a few seconds to boot the
//! display stack, so the probe polls with a short per-request timeout.

use std::time::Duration;

use deskhive_core::TimeoutConfig;
use tracing::{debug, info, warn};

/// User agent sent with every probe request so it is identifiable in
/// container access logs.
pub const PROBE_USER_AGENT: &str = "deskhive-readiness-probe";

pub struct ReadinessProbe {
    client: reqwest::Client,
    attempts: u32,
    request_timeout: Duration,
    delay: Duration,
}

impl ReadinessProbe {
    pub fn new(timeouts: &TimeoutConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            attempts: timeouts.readiness_attempts.max(1),
            request_timeout: timeouts.probe_request(),
            delay: timeouts.readiness_delay(),
        }
    }

    /// Polls `http://{hostname}:{port}/` until it returns 200 or the attempt
    /// budget runs out. Returns whether the display server became ready.
    pub async fn wait_until_ready(&self, hostname: &str, port: u16) -> bool {
        let url = format!("http://{hostname}:{port}/");
        for attempt in 1..=self.attempts {
            let response = self
                .client
                .get(&url)
                .timeout(self.request_timeout)
                .header(reqwest::header::USER_AGENT, PROBE_USER_AGENT)
                .send()
                .await;
            match response {
                Ok(response) if response.status() == reqwest::StatusCode::OK => {
                    info!("display server at {url} ready after {attempt} attempt(s)");
                    return true;
                }
                Ok(response) => {
                    debug!("display server at {url} answered {}", response.status());
                }
                Err(error) => {
                    debug!("display server at {url} not answering: {error}");
                }
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.delay).await;
            }
        }
        warn!(
            "display server at {url} not ready after {} attempt(s)",
            self.attempts
        );
        false
    }
}
