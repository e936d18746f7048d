//! HTTP Control Plane
//!
//! REST surface for registration, liveness and delay reporting:
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | POST   | `/clients` | register the caller under a username |
//! | GET    | `/clients` | the caller's own binding |
//! | GET    | `/clients/:username` | look a user up by name |
//! | DELETE | `/clients` | deregister the caller |
//! | PUT    | `/clients/delays` | replace a user's latency table |
//! | POST   | `/services` | register/refresh a relay heartbeat |
//! | GET    | `/services` | live relays only |
//! | PATCH  | `/services` | heartbeat an already-known relay |
//! | DELETE | `/services` | remove a relay |
//!
//! The caller's address is always taken from the connection
//! ([`ConnectInfo`]), never from the request body. Directory misses map to
//! 404, a taken username to 409; relay staleness is not an error and simply
//! filters `GET /services`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::directory::Directory;

#[derive(Clone)]
struct AppState {
    directory: Arc<dyn Directory>,
}

/// Build the control-plane router. Serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()` so handlers can see
/// the caller's address.
pub fn build_router(directory: Arc<dyn Directory>) -> Router {
    Router::new()
        .route("/clients", post(register_client).get(get_client).delete(delete_client))
        .route("/clients/:username", get(get_client_by_username))
        .route("/clients/delays", put(put_delays))
        .route(
            "/services",
            post(register_service)
                .get(list_services)
                .patch(heartbeat_service)
                .delete(delete_service),
        )
        .with_state(AppState { directory })
}

// ============================================================================
// /clients
// ============================================================================

#[derive(Debug, Deserialize)]
struct ClientRegistration {
    username: String,
}

async fn register_client(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<ClientRegistration>,
) -> (StatusCode, Json<Value>) {
    let client_ip = addr.ip().to_string();
    match state.directory.register_user(&client_ip, &req.username) {
        Ok(()) => {
            info!(ip = %client_ip, username = %req.username, "registered client");
            (
                StatusCode::CREATED,
                Json(json!({
                    "message": "Client registered",
                    "ip": client_ip,
                    "username": req.username,
                })),
            )
        }
        Err(e) => (StatusCode::CONFLICT, Json(json!({ "error": e.to_string() }))),
    }
}

async fn get_client(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> (StatusCode, Json<Value>) {
    let client_ip = addr.ip().to_string();
    match state.directory.lookup_by_addr(&client_ip) {
        Ok(username) => {
            (StatusCode::OK, Json(json!({ "ip": client_ip, "username": username })))
        }
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({ "error": e.to_string() }))),
    }
}

async fn get_client_by_username(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.directory.lookup_by_name(&username) {
        Ok(ip) => (StatusCode::OK, Json(json!({ "ip": ip, "username": username }))),
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({ "error": e.to_string() }))),
    }
}

async fn delete_client(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> (StatusCode, Json<Value>) {
    let client_ip = addr.ip().to_string();
    match state.directory.remove_by_addr(&client_ip) {
        Ok(username) => {
            info!(ip = %client_ip, username = %username, "deregistered client");
            (StatusCode::OK, Json(json!({ "message": "Client deleted", "ip": client_ip })))
        }
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({ "error": e.to_string() }))),
    }
}

#[derive(Debug, Deserialize)]
struct DelayReport {
    username: String,
    delays: HashMap<String, f64>,
}

/// Latency tables are replaced wholesale and trusted verbatim.
async fn put_delays(
    State(state): State<AppState>,
    Json(report): Json<DelayReport>,
) -> (StatusCode, Json<Value>) {
    state.directory.put_delays(&report.username, report.delays);
    (StatusCode::OK, Json(json!({ "message": "Delays updated" })))
}

// ============================================================================
// /services
// ============================================================================

async fn register_service(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> (StatusCode, Json<Value>) {
    let service_ip = addr.ip().to_string();
    state.directory.upsert_relay_heartbeat(&service_ip);
    info!(ip = %service_ip, "registered relay");
    (StatusCode::CREATED, Json(json!({ "message": "Service registered", "ip": service_ip })))
}

async fn list_services(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let services = state.directory.list_live_relays();
    (StatusCode::OK, Json(json!({ "services": services })))
}

async fn heartbeat_service(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> (StatusCode, Json<Value>) {
    let service_ip = addr.ip().to_string();
    match state.directory.refresh_relay_heartbeat(&service_ip) {
        Ok(()) => (StatusCode::OK, Json(json!({ "message": "Heartbeat recorded", "ip": service_ip }))),
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({ "error": e.to_string() }))),
    }
}

async fn delete_service(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> (StatusCode, Json<Value>) {
    let service_ip = addr.ip().to_string();
    match state.directory.remove_relay(&service_ip) {
        Ok(()) => {
            info!(ip = %service_ip, "removed relay");
            (StatusCode::OK, Json(json!({ "message": "Service deleted", "ip": service_ip })))
        }
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({ "error": e.to_string() }))),
    }
}

// ============================================================================
// Tests
// ============================================================================
