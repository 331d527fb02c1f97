//! C6 — Router.
//!
//! The single axum entry point: fixed routes for health/stats/tunnel-connect,
//! then a host-based fallback that extracts the agent address from the
//! leftmost DNS label and hands the request to the Multiplexer.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Request};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::address::AgentAddress;
use crate::error::RelayError;
use crate::multiplexer;
use crate::state::AppState;
use crate::tunnel;

/// Every agent chooses its own callers' origins, so there's no fixed
/// allow-list to enforce here — matches the teacher's own
/// `CorsLayer::permissive()` choice for the same reason (any dashboard or
/// tool may call `/api/agents`). `CorsLayer` also answers `OPTIONS`
/// preflights itself, before a request ever reaches `host_routed`.
pub fn build(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/tunnel/connect", axum::routing::any(tunnel_connect))
        .fallback(host_routed)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Fixed routes ────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    tunnels: usize,
}

/// `GET /health` — unauthenticated, unrated liveness probe.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthBody {
        status: "ok",
        tunnels: state.registry().active_tunnels(),
    })
}

#[derive(Serialize)]
struct StatsBody {
    uptime_seconds: u64,
    active_tunnels: usize,
    active_agents: usize,
    total_requests_relayed: u64,
    total_tunnel_connections: u64,
}

/// `GET /stats` — process counters, rate-limited per client IP.
async fn stats(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let client_ip = client_ip(&headers, peer);
    if !state.stats_limiter().allow(&client_ip) {
        return RelayError::RateLimited.into_response();
    }
    Json(StatsBody {
        uptime_seconds: state.uptime_seconds(),
        active_tunnels: state.registry().active_tunnels(),
        active_agents: state.registry().active_agents(),
        total_requests_relayed: state.total_requests_relayed(),
        total_tunnel_connections: state.total_tunnel_connections(),
    })
    .into_response()
}

/// `/tunnel/connect` — the only route an agent runtime speaks to. Rejects
/// plain HTTP (no `Upgrade` header) before touching the rate limiter.
async fn tunnel_connect(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let Some(ws) = ws else {
        return RelayError::WebsocketRequired.into_response();
    };
    let client_ip = client_ip(&headers, peer);
    if !state.connect_limiter().allow(&client_ip) {
        return RelayError::RateLimited.into_response();
    }

    let registry = state.registry_arc();
    let base_domain = state.base_domain().clone();
    state.record_tunnel_connection();
    // The tunnel's whole lifetime runs inside this upgrade callback; `run`
    // only returns once the socket is gone and teardown has completed.
    ws.on_upgrade(move |socket| async move {
        tunnel::run(socket, base_domain, registry).await;
    })
}

// ─── Host-based fallback ─────────────────────────────────────────

/// Anything not matching a fixed route: the `Host` header's leftmost label
/// is the target agent's address, rate-limited per address rather than per
/// client IP so one noisy caller can't starve requests to other agents.
async fn host_routed(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<axum::body::Body>,
) -> Response {
    let headers = request.headers().clone();

    let Some(label) = leftmost_label(&headers, state.base_domain()) else {
        return RelayError::InvalidSubdomain.into_response();
    };
    if !AgentAddress::is_well_formed_label(&label) {
        return RelayError::InvalidSubdomain.into_response();
    }
    let Ok(address) = AgentAddress::parse(&label) else {
        return RelayError::InvalidSubdomain.into_response();
    };

    let client_ip = client_ip(&headers, peer);
    if !state.request_limiter().allow(address.as_str()) {
        return RelayError::RateLimited.into_response();
    }

    match multiplexer::submit_request(state.registry(), &address, &client_ip, request).await {
        Ok(response) => {
            state.record_request_relayed();
            response
        }
        Err(err) => err.into_response(),
    }
}

/// Extracts the leftmost DNS label of `Host` if it is a subdomain of
/// `base_domain`; `None` if `Host` is missing or doesn't match.
fn leftmost_label(headers: &HeaderMap, base_domain: &str) -> Option<String> {
    let host = headers.get(axum::http::header::HOST)?.to_str().ok()?;
    let host = host.split(':').next().unwrap_or(host);
    let suffix = format!(".{base_domain}");
    let label = host.strip_suffix(&suffix)?;
    if label.is_empty() || label.contains('.') {
        return None;
    }
    Some(label.to_string())
}

/// Prefers the fronting load balancer's own header over a client-supplied
/// `x-forwarded-for`, falling back to the raw peer address if neither is set.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(ip) = headers.get("fly-client-ip").and_then(|v| v.to_str().ok()) {
        return ip.to_string();
    }
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    peer.ip().to_string()
}
