//! HTTP status API
//!
//! Read-only JSON endpoint consumed by the `status` CLI and external
//! monitoring: `GET /status` for the whole fleet, `GET /status/{iface}`
//! for a single interface. Responds 200 when any statuses are present
//! and 204 otherwise.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::capture::{CaptureManager, InterfaceStats};
use crate::db::WriteoutHandler;

/// Default listen address of the status API
pub const DEFAULT_API_ADDR: &str = "127.0.0.1:6060";

const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Status of the whole fleet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status_code: u16,
    pub last_writeout_timestamp: Option<DateTime<Utc>>,
    pub started_at_timestamp: DateTime<Utc>,
    pub statuses: HashMap<String, InterfaceStats>,
}

/// Shared state of the API handlers
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<tokio::sync::Mutex<CaptureManager>>,
    pub writeout: WriteoutHandler,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(all_statuses))
        .route("/status/{iface}", get(iface_status))
        .with_state(state)
}

/// Serve the status API until the process exits
pub async fn serve(addr: &str, state: ApiState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status API to {addr}"))?;
    info!(addr = %addr, "status API listening");

    axum::serve(listener, router(state))
        .await
        .context("status API server failed")
}

async fn all_statuses(State(state): State<ApiState>) -> Response {
    status_response(&state, &[]).await
}

async fn iface_status(Path(iface): Path<String>, State(state): State<ApiState>) -> Response {
    status_response(&state, &[iface]).await
}

async fn status_response(state: &ApiState, ifaces: &[String]) -> Response {
    let (statuses, started_at) = {
        let manager = state.manager.lock().await;
        (manager.status(ifaces).await, manager.started_at())
    };

    if statuses.is_empty() {
        return StatusCode::NO_CONTENT.into_response();
    }

    let response = StatusResponse {
        status_code: StatusCode::OK.as_u16(),
        last_writeout_timestamp: state.writeout.last_writeout(),
        started_at_timestamp: started_at,
        statuses: statuses
            .into_iter()
            .map(|(iface, status)| (iface, status.stats))
            .collect(),
    };
    (StatusCode::OK, Json(response)).into_response()
}

/// Fetch the fleet status from a running daemon
pub async fn fetch_status(addr: &str) -> Result<StatusResponse> {
    let client = reqwest::Client::builder()
        .timeout(CLIENT_TIMEOUT)
        .build()
        .context("failed to build HTTP client")?;

    let response = client
        .get(format!("http://{addr}/status"))
        .send()
        .await
        .with_context(|| format!("failed to reach flowprobe at {addr}"))?;

    if response.status() == reqwest::StatusCode::NO_CONTENT {
        return Ok(StatusResponse {
            status_code: StatusCode::NO_CONTENT.as_u16(),
            last_writeout_timestamp: None,
            started_at_timestamp: DateTime::UNIX_EPOCH,
            statuses: HashMap::new(),
        });
    }

    let response = response
        .error_for_status()
        .context("status request failed")?;
    response
        .json()
        .await
        .context("failed to decode status response")
}
