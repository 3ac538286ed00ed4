//! Request handlers for `/api/v1`.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use relay_core::logging::LogRecord;
use relay_core::{AppConfig, TransportKind, TunnelConfig, TunnelState, TunnelStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use crate::error::{ApiError, Result};
use crate::state::ApiState;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

/// Liveness only.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    })
}

pub async fn status(State(state): State<ApiState>) -> Json<BTreeMap<String, TunnelStatus>> {
    Json(state.orchestrator.status())
}

pub async fn get_config(State(state): State<ApiState>) -> Json<AppConfig> {
    Json(state.current_config().redacted())
}

pub async fn list_servers(State(state): State<ApiState>) -> Json<Vec<TunnelConfig>> {
    Json(
        state
            .orchestrator
            .tunnels()
            .iter()
            .map(TunnelConfig::redacted)
            .collect(),
    )
}

pub async fn create_server(
    State(state): State<ApiState>,
    payload: std::result::Result<Json<TunnelConfig>, JsonRejection>,
) -> Result<(StatusCode, Json<TunnelConfig>)> {
    let Json(record) = payload?;
    let stored = state.orchestrator.add_tunnel(record)?;
    state.persist();
    Ok((StatusCode::CREATED, Json(stored.redacted())))
}

pub async fn get_server(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<TunnelConfig>> {
    state
        .orchestrator
        .tunnel(&name)
        .map(|record| Json(record.redacted()))
        .ok_or_else(|| ApiError::NotFound(format!("server {name}")))
}

/// The name in the path wins over any name in the body.
pub async fn update_server(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    payload: std::result::Result<Json<TunnelConfig>, JsonRejection>,
) -> Result<Json<TunnelConfig>> {
    let Json(record) = payload?;
    state.orchestrator.update_tunnel(&name, record).await?;
    state.persist();
    get_server(State(state), Path(name)).await
}

pub async fn delete_server(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    state.orchestrator.remove_tunnel(&name).await?;
    state.persist();
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub server: String,
    pub latency_ms: u64,
}

pub async fn test_server(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<ProbeResponse>> {
    let latency = state.orchestrator.test(&name).await?;
    Ok(Json(ProbeResponse {
        server: name,
        latency_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
    }))
}

/// One configured tunnel joined with its run state.
#[derive(Debug, Serialize, Deserialize)]
pub struct TunnelView {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    pub enabled: bool,
    /// Absent for disabled tunnels and transports without an adapter
    pub status: Option<TunnelStatus>,
}

pub async fn list_tunnels(State(state): State<ApiState>) -> Json<Vec<TunnelView>> {
    let statuses = state.orchestrator.status();
    let views = state
        .orchestrator
        .tunnels()
        .into_iter()
        .map(|record| TunnelView {
            status: statuses.get(&record.name).cloned(),
            port: record.port_or_default(),
            name: record.name,
            host: record.host,
            transport: record.transport,
            enabled: record.enabled,
        })
        .collect();
    Json(views)
}

#[derive(Debug, Deserialize)]
pub struct TunnelQuery {
    pub server: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActionResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}

/// Starts `?server=`, or runs auto-selection when no server is named.
pub async fn start_tunnel(
    State(state): State<ApiState>,
    query: std::result::Result<Query<TunnelQuery>, QueryRejection>,
) -> Result<(StatusCode, Json<ActionResponse>)> {
    let Query(query) = query?;
    let server = match query.server.filter(|s| !s.is_empty()) {
        Some(name) => {
            state.orchestrator.start_tunnel(&name)?;
            name
        }
        None => state.orchestrator.start().await?.ok_or_else(|| {
            ApiError::BadRequest("no server given and auto_select is disabled".to_string())
        })?,
    };
    info!(tunnel = %server, "Tunnel start requested over the API");
    Ok((
        StatusCode::ACCEPTED,
        Json(ActionResponse {
            message: "Tunnel starting".to_string(),
            server: Some(server),
        }),
    ))
}

/// Stops `?server=`, or every tunnel when no server is named.
pub async fn stop_tunnel(
    State(state): State<ApiState>,
    query: std::result::Result<Query<TunnelQuery>, QueryRejection>,
) -> Result<Json<ActionResponse>> {
    let Query(query) = query?;
    let server = query.server.filter(|s| !s.is_empty());
    match server.as_deref() {
        Some(name) => state.orchestrator.stop_tunnel(name).await?,
        None => state.orchestrator.stop_all().await?,
    }
    Ok(Json(ActionResponse {
        message: "Tunnels stopped".to_string(),
        server,
    }))
}

pub async fn restart_tunnels(State(state): State<ApiState>) -> Result<Json<ActionResponse>> {
    let server = state.orchestrator.restart_all().await?;
    Ok(Json(ActionResponse {
        message: "Tunnels restarted".to_string(),
        server,
    }))
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub uptime_secs: u64,
    pub tunnels: usize,
    pub connecting: usize,
    pub connected: usize,
    pub failed: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

pub async fn metrics(State(state): State<ApiState>) -> Json<Metrics> {
    let statuses = state.orchestrator.status();
    let count = |wanted: TunnelState| statuses.values().filter(|s| s.state == wanted).count();

    Json(Metrics {
        uptime_secs: state.started_at.elapsed().as_secs(),
        tunnels: statuses.len(),
        connecting: count(TunnelState::Connecting),
        connected: count(TunnelState::Connected),
        failed: count(TunnelState::Error),
        bytes_sent: statuses.values().map(|s| s.bytes_sent).sum(),
        bytes_received: statuses.values().map(|s| s.bytes_received).sum(),
    })
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    /// Newest `limit` entries only
    pub limit: Option<usize>,
}

pub async fn logs(
    State(state): State<ApiState>,
    Query(query): Query<LogQuery>,
) -> Json<Vec<LogRecord>> {
    let mut records = state.logs.as_ref().map(|l| l.snapshot()).unwrap_or_default();
    if let Some(limit) = query.limit {
        let skip = records.len().saturating_sub(limit);
        records.drain(..skip);
    }
    Json(records)
}
