//! Local API Server
//!
//! Loopback control surface for sibling processes: the dashboard reads
//! status and metrics, the session manager blocks and unblocks clients,
//! and an operator can nudge the next decision with an override.

use crate::routing::MacAddr;
use crate::supervisor::ControlHandle;
use crate::{Uplink, UplinkError};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use tower_http::trace::TraceLayer;

/// Build the API router
pub fn create_router(handle: ControlHandle) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/history", get(history))
        .route("/metrics", get(metrics))
        .route("/override", post(request_override))
        .route("/clients/block", post(block_client))
        .route("/clients/unblock", post(unblock_client))
        .layer(TraceLayer::new_for_http())
        .with_state(handle)
}

/// Serve until the supervisor shuts down
pub async fn start_server(listen: SocketAddr, handle: ControlHandle) -> Result<(), UplinkError> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!("Uplink API listening on {}", listen);

    let stopping = handle.clone();
    axum::serve(listener, create_router(handle))
        .with_graceful_shutdown(async move { stopping.stopping().await })
        .await?;

    tracing::info!("Uplink API stopped");
    Ok(())
}

#[derive(Debug, Serialize)]
struct StatusMessage {
    status: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error(code: StatusCode, message: impl Into<String>) -> Response {
    (code, Json(ErrorBody { error: message.into() })).into_response()
}

async fn health() -> &'static str {
    "OK"
}

async fn status(State(handle): State<ControlHandle>) -> Response {
    match handle.published_snapshot().await {
        Ok(Some(snapshot)) => Json(snapshot).into_response(),
        Ok(None) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(StatusMessage {
                status: "no data yet".into(),
            }),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to read status snapshot");
            error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn history(State(handle): State<ControlHandle>) -> impl IntoResponse {
    Json(handle.history())
}

async fn metrics(State(handle): State<ControlHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        handle.prometheus(),
    )
}

#[derive(Debug, Deserialize)]
struct OverrideRequest {
    preferred_interface: Uplink,
}

#[derive(Debug, Serialize)]
struct OverrideAccepted {
    status: &'static str,
    preferred_interface: Uplink,
}

async fn request_override(
    State(handle): State<ControlHandle>,
    Json(req): Json<OverrideRequest>,
) -> impl IntoResponse {
    handle.request_override(req.preferred_interface);
    (
        StatusCode::ACCEPTED,
        Json(OverrideAccepted {
            status: "accepted",
            preferred_interface: req.preferred_interface,
        }),
    )
}

#[derive(Debug, Deserialize)]
struct ClientRequest {
    ip: String,
    mac: String,
}

impl ClientRequest {
    fn parse(&self) -> Result<(IpAddr, MacAddr), UplinkError> {
        let ip = self
            .ip
            .parse()
            .map_err(|_| UplinkError::InvalidClient(format!("bad IP address {:?}", self.ip)))?;
        let mac = self.mac.parse()?;
        Ok((ip, mac))
    }
}

async fn block_client(State(handle): State<ControlHandle>, Json(req): Json<ClientRequest>) -> Response {
    let (ip, mac) = match req.parse() {
        Ok(client) => client,
        Err(e) => return error(StatusCode::BAD_REQUEST, e.to_string()),
    };
    match handle.block_client(ip, mac).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            tracing::error!(%ip, %mac, error = %e, "Failed to block client");
            error(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

async fn unblock_client(State(handle): State<ControlHandle>, Json(req): Json<ClientRequest>) -> Response {
    let (ip, mac) = match req.parse() {
        Ok(client) => client,
        Err(e) => return error(StatusCode::BAD_REQUEST, e.to_string()),
    };
    match handle.unblock_client(ip, mac).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            tracing::error!(%ip, %mac, error = %e, "Failed to unblock client");
            error(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}
