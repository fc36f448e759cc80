//! Axum gateway exposing the desktop session API.
//!
//! User routes live under `/api/desktop` and operate on the caller's own
//! session. Admin routes live under `/admin/api` and cover the whole fleet,
//! including a server-sent event feed of the activity log.

pub mod server;

pub use server::{build_gateway_router, run_gateway_server, GatewayState};
