//! HTTP surface of the deskhive daemon.
//!
//! Identity arrives in trusted headers set by the fronting proxy after it has
//! authenticated the user; the gateway never sees credentials. User routes
//! manage the caller's own session, admin routes require the admin header and
//! expose fleet state plus the live event feed.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use deskhive_core::ServiceConfig;
use deskhive_events::{Event, EventDraft, EventLevel, EventLog, EVENT_ADMIN_ACTION};
use deskhive_fleet::HostOrchestrator;
use deskhive_session::{commands, CreationPhase, SessionError, SessionManager, SessionUser};
use futures_util::{stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::info;

const DESKTOP_STATUS_ENDPOINT: &str = "/api/desktop/status";
const DESKTOP_SESSIONS_ENDPOINT: &str = "/api/desktop/sessions";
const DESKTOP_CREATION_STATUS_ENDPOINT: &str = "/api/desktop/creation-status";
const DESKTOP_EXTEND_ENDPOINT: &str = "/api/desktop/extend";
const DESKTOP_CONNECT_INFO_ENDPOINT: &str = "/api/desktop/connect-info";
const ADMIN_SESSIONS_ENDPOINT: &str = "/admin/api/sessions";
const ADMIN_KILL_ENDPOINT: &str = "/admin/api/sessions/kill";
const ADMIN_EXTEND_ENDPOINT: &str = "/admin/api/sessions/extend";
const ADMIN_HOSTS_ENDPOINT: &str = "/admin/api/hosts";
const ADMIN_PROBE_ENDPOINT: &str = "/admin/api/hosts/probe";
const ADMIN_CLEANUP_ENDPOINT: &str = "/admin/api/cleanup";
const ADMIN_EVENTS_ENDPOINT: &str = "/admin/api/events";
const ADMIN_EVENTS_STREAM_ENDPOINT: &str = "/admin/api/events/stream";

const USER_ID_HEADER: &str = "x-deskhive-user";
const USERNAME_HEADER: &str = "x-deskhive-name";
const ADMIN_HEADER: &str = "x-deskhive-admin";

/// How many recent events a new feed subscriber gets replayed.
const EVENT_STREAM_REPLAY: usize = 50;
const EVENT_STREAM_KEEPALIVE: Duration = Duration::from_secs(30);
const DEFAULT_EVENTS_LIMIT: usize = 100;

/// Shared handles every route needs.
pub struct GatewayState {
    pub config: Arc<ServiceConfig>,
    pub sessions: Arc<SessionManager>,
    pub fleet: Arc<HostOrchestrator>,
    pub events: Arc<EventLog>,
}

struct Identity {
    user: SessionUser,
    admin: bool,
}

pub fn build_gateway_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route(DESKTOP_STATUS_ENDPOINT, get(handle_desktop_status))
        .route(
            DESKTOP_SESSIONS_ENDPOINT,
            post(handle_desktop_create).delete(handle_desktop_destroy),
        )
        .route(
            DESKTOP_CREATION_STATUS_ENDPOINT,
            get(handle_desktop_creation_status),
        )
        .route(DESKTOP_EXTEND_ENDPOINT, post(handle_desktop_extend))
        .route(
            DESKTOP_CONNECT_INFO_ENDPOINT,
            get(handle_desktop_connect_info),
        )
        .route(ADMIN_SESSIONS_ENDPOINT, get(handle_admin_sessions))
        .route(ADMIN_KILL_ENDPOINT, post(handle_admin_kill))
        .route(ADMIN_EXTEND_ENDPOINT, post(handle_admin_extend))
        .route(ADMIN_HOSTS_ENDPOINT, get(handle_admin_hosts))
        .route(ADMIN_PROBE_ENDPOINT, post(handle_admin_probe))
        .route(ADMIN_CLEANUP_ENDPOINT, post(handle_admin_cleanup))
        .route(ADMIN_EVENTS_ENDPOINT, get(handle_admin_events))
        .route(
            ADMIN_EVENTS_STREAM_ENDPOINT,
            get(handle_admin_events_stream),
        )
        .with_state(state)
}

/// Binds the gateway and serves it until the shutdown future resolves.
pub async fn run_gateway_server<F>(bind: &str, state: Arc<GatewayState>, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let bind_addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address '{bind}'"))?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind gateway on {bind_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound gateway address")?;
    info!("gateway listening on {local_addr}");
    axum::serve(listener, build_gateway_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("gateway server exited unexpectedly")
}

fn identity_from_headers(headers: &HeaderMap) -> Result<Identity, Response> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());
    let Some(user_id) = user_id else {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "missing or invalid identity headers",
        ));
    };
    let username = headers
        .get(USERNAME_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("unknown")
        .to_string();
    let admin = headers
        .get(ADMIN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            let value = value.trim();
            value == "1" || value.eq_ignore_ascii_case("true")
        })
        .unwrap_or(false);
    Ok(Identity {
        user: SessionUser {
            id: user_id,
            username,
        },
        admin,
    })
}

fn require_admin(headers: &HeaderMap) -> Result<Identity, Response> {
    let identity = identity_from_headers(headers)?;
    if !identity.admin {
        return Err(error_response(
            StatusCode::FORBIDDEN,
            "admin privileges required",
        ));
    }
    Ok(identity)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": message.into() })),
    )
        .into_response()
}

fn session_error_response(error: &SessionError) -> Response {
    use deskhive_fleet::FleetError;
    let status = match error {
        SessionError::AlreadyExists { .. }
        | SessionError::ExtensionLimitReached { .. }
        | SessionError::TimerNotStarted { .. } => StatusCode::CONFLICT,
        SessionError::NotFound { .. } => StatusCode::NOT_FOUND,
        SessionError::Fleet(FleetError::PoolExhausted { .. })
        | SessionError::Fleet(FleetError::NoHealthyHosts) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, error.to_string())
}

async fn handle_desktop_status(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    let identity = match identity_from_headers(&headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    let session = state.sessions.session_status(identity.user.id).await;
    (
        StatusCode::OK,
        Json(json!({ "success": true, "session": session })),
    )
        .into_response()
}

async fn handle_desktop_create(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    let identity = match identity_from_headers(&headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    match state.sessions.create(identity.user) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({ "success": true, "status": "creating" })),
        )
            .into_response(),
        Err(error) => session_error_response(&error),
    }
}

async fn handle_desktop_destroy(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    let identity = match identity_from_headers(&headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    match state.sessions.destroy(identity.user.id).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "success": true }))).into_response(),
        Err(error) => session_error_response(&error),
    }
}

async fn handle_desktop_creation_status(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    let identity = match identity_from_headers(&headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    let creation = state.sessions.creation_status(identity.user.id);
    // Once the desktop is ready the session view also starts the countdown,
    // so the pending page can hand off straight to a running timer.
    let session = match &creation {
        Some(status) if status.phase == CreationPhase::Ready => {
            state.sessions.session_status(identity.user.id).await
        }
        _ => None,
    };
    (
        StatusCode::OK,
        Json(json!({ "success": true, "creation": creation, "session": session })),
    )
        .into_response()
}

async fn handle_desktop_extend(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    let identity = match identity_from_headers(&headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    match state.sessions.extend_timer(identity.user.id) {
        Ok(timer) => (
            StatusCode::OK,
            Json(json!({ "success": true, "timer": timer })),
        )
            .into_response(),
        Err(error) => session_error_response(&error),
    }
}

/// Resolves where the caller's desktop lives, for reverse-proxy auth
/// subrequests. The target is mirrored into response headers so the proxy
/// can route without parsing the body.
async fn handle_desktop_connect_info(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    let identity = match identity_from_headers(&headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    let Some((host, port, vnc_port)) = state.sessions.connect_target(identity.user.id) else {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("no active session for user {}", identity.user.id),
        );
    };
    let host_header = HeaderValue::from_str(&host).ok();
    let port_header = HeaderValue::from_str(&port.to_string()).ok();
    let mut response = (
        StatusCode::OK,
        Json(json!({ "success": true, "host": host, "port": port, "vnc_port": vnc_port })),
    )
        .into_response();
    if let Some(value) = host_header {
        response.headers_mut().insert("x-desktop-host", value);
    }
    if let Some(value) = port_header {
        response.headers_mut().insert("x-desktop-port", value);
    }
    response
}

async fn handle_admin_sessions(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = require_admin(&headers) {
        return response;
    }
    // Sweep first so the listing never shows sessions that already expired.
    state.sessions.periodic_cleanup().await;
    let sessions = state.sessions.all_sessions();
    (
        StatusCode::OK,
        Json(json!({ "success": true, "sessions": sessions })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct AdminSessionTarget {
    user_id: u64,
}

async fn handle_admin_kill(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(target): Json<AdminSessionTarget>,
) -> Response {
    let identity = match require_admin(&headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    let target_username = state
        .sessions
        .all_sessions()
        .iter()
        .find(|session| session.user_id == target.user_id)
        .map(|session| session.record.username.clone())
        .unwrap_or_default();
    state.events.record(
        EventDraft::for_user(
            EVENT_ADMIN_ACTION,
            EventLevel::Warning,
            format!(
                "admin {} requested session kill for user {}",
                identity.user.username, target.user_id
            ),
            target.user_id,
            &target_username,
        )
        .with_metadata(json!({
            "admin_id": identity.user.id,
            "admin_name": identity.user.username,
            "action": "kill_session",
        })),
    );
    match state.sessions.destroy(target.user_id).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "success": true }))).into_response(),
        Err(error) => session_error_response(&error),
    }
}

async fn handle_admin_extend(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(target): Json<AdminSessionTarget>,
) -> Response {
    let identity = match require_admin(&headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    match state.sessions.extend_timer(target.user_id) {
        Ok(timer) => {
            state.events.record(
                EventDraft::new(
                    EVENT_ADMIN_ACTION,
                    EventLevel::Info,
                    format!(
                        "admin {} extended the session of user {}",
                        identity.user.username, target.user_id
                    ),
                )
                .with_metadata(json!({
                    "admin_id": identity.user.id,
                    "admin_name": identity.user.username,
                    "action": "extend_session",
                    "target_user_id": target.user_id,
                })),
            );
            (
                StatusCode::OK,
                Json(json!({ "success": true, "timer": timer })),
            )
                .into_response()
        }
        Err(error) => session_error_response(&error),
    }
}

async fn handle_admin_hosts(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = require_admin(&headers) {
        return response;
    }
    let hosts = state.fleet.host_status();
    (
        StatusCode::OK,
        Json(json!({ "success": true, "hosts": hosts })),
    )
        .into_response()
}

async fn handle_admin_probe(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = require_admin(&headers) {
        return response;
    }
    let command = commands::image_probe(&state.config.container_image);
    let report = state
        .fleet
        .connectivity_probe(&command, state.config.timeouts.quick_command())
        .await;
    (
        StatusCode::OK,
        Json(json!({ "success": true, "hosts": report })),
    )
        .into_response()
}

async fn handle_admin_cleanup(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = require_admin(&headers) {
        return response;
    }
    let removed = state.sessions.periodic_cleanup().await;
    (
        StatusCode::OK,
        Json(json!({ "success": true, "removed": removed })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    limit: Option<usize>,
}

async fn handle_admin_events(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Response {
    if let Err(response) = require_admin(&headers) {
        return response;
    }
    let limit = query.limit.unwrap_or(DEFAULT_EVENTS_LIMIT);
    let events = state.events.recent(limit);
    (
        StatusCode::OK,
        Json(json!({ "success": true, "events": events })),
    )
        .into_response()
}

/// Live event feed: replays the recent window, then streams new events.
/// Subscribing before the replay snapshot means a burst in between shows up
/// twice rather than not at all. Dropping the connection drops the receiver;
/// the event log prunes the dead subscriber on its next append.
async fn handle_admin_events_stream(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = require_admin(&headers) {
        return response;
    }
    let subscription = state.events.subscribe();
    let replay: Vec<SseEvent> = state
        .events
        .recent(EVENT_STREAM_REPLAY)
        .into_iter()
        .map(sse_frame)
        .collect();
    let live = UnboundedReceiverStream::new(subscription.receiver).map(sse_frame);
    let feed = stream::iter(replay)
        .chain(live)
        .map(Ok::<SseEvent, Infallible>);
    Sse::new(feed)
        .keep_alive(KeepAlive::new().interval(EVENT_STREAM_KEEPALIVE))
        .into_response()
}

fn sse_frame(event: Event) -> SseEvent {
    let payload = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
    SseEvent::default().data(payload)
}
