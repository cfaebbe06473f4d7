//! Consensus status and admin handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::ApiState;
use crate::errors::ConsensusError;
use crate::network_state::{ConsensusView, MinerListing};

/// Error body: `{"error": "..."}`
#[derive(Debug)]
pub struct ApiError(pub ConsensusError);

impl From<ConsensusError> for ApiError {
    fn from(err: ConsensusError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ConsensusError::UnknownNetwork(_) => StatusCode::NOT_FOUND,
            ConsensusError::NetworkExists(_) => StatusCode::CONFLICT,
            ConsensusError::InvalidUrl { .. } | ConsensusError::Config(_) => {
                StatusCode::BAD_REQUEST
            }
            ConsensusError::NoMinerUrl(_) | ConsensusError::Probe(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ConsensusError::Store(_) | ConsensusError::Encoding(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSummary {
    pub name: String,
    pub height: u64,
    pub is_current: bool,
    pub known_urls: usize,
}

/// Agreed view plus the tuning knobs an operator may override
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusResponse {
    pub height: u64,
    pub digest: Option<String>,
    pub is_current: bool,
    pub genesis: Option<String>,
    pub step: u64,
    pub threshold: u32,
    pub round: u64,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct ServiceUrlQuery {
    pub path: String,
    #[serde(default)]
    pub latest: bool,
}

#[derive(Debug, Deserialize)]
pub struct StepUpdate {
    pub step: u64,
}

#[derive(Debug, Deserialize)]
pub struct ThresholdUpdate {
    pub threshold: u32,
}

#[derive(Debug, Deserialize)]
pub struct UrlsUpdate {
    pub urls: Vec<String>,
}

/// GET /networks
pub async fn list_networks(State(state): State<ApiState>) -> Json<Vec<NetworkSummary>> {
    let summaries = state
        .networks
        .names()
        .into_iter()
        .filter_map(|name| state.networks.get(&name))
        .map(|svc| {
            let snapshot = svc.snapshot();
            NetworkSummary {
                name: svc.name().to_string(),
                height: snapshot.state.height,
                is_current: snapshot.state.is_current,
                known_urls: snapshot.known_urls,
            }
        })
        .collect();
    Json(summaries)
}

/// GET /networks/:name/consensus
pub async fn get_consensus(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<ConsensusResponse>, ApiError> {
    let svc = state.networks.require(&name)?;
    let snapshot = svc.snapshot();
    let s = &snapshot.state;
    Ok(Json(ConsensusResponse {
        height: s.height,
        digest: s.digest.clone(),
        is_current: s.is_current,
        genesis: s.genesis.clone(),
        step: s.step,
        threshold: s.threshold,
        round: snapshot.round,
        updated_at: snapshot.updated_at.to_rfc3339(),
    }))
}

/// GET /networks/:name/miners
pub async fn get_miners(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<MinerListing>, ApiError> {
    let svc = state.networks.require(&name)?;
    Ok(Json(svc.miners()))
}

/// GET /networks/:name/service_url?path=..&latest=bool
pub async fn get_service_url(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(q): Query<ServiceUrlQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let svc = state.networks.require(&name)?;
    let url = svc.service_url(&q.path, &[], q.latest)?;
    Ok(Json(json!({ "url": url })))
}

/// POST /networks/:name/reset
pub async fn reset(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    let svc = state.networks.require(&name)?;
    svc.reset_consensus();
    info!(target: "volition::api", "[API] Reset requested for {}", name);
    Ok(StatusCode::NO_CONTENT)
}

/// POST /networks/:name/step
pub async fn set_step(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(req): Json<StepUpdate>,
) -> Result<StatusCode, ApiError> {
    let svc = state.networks.require(&name)?;
    svc.set_step(req.step);
    info!(target: "volition::api", "[API] Step for {} set to {}", name, req.step);
    Ok(StatusCode::NO_CONTENT)
}

/// POST /networks/:name/threshold
pub async fn set_threshold(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(req): Json<ThresholdUpdate>,
) -> Result<StatusCode, ApiError> {
    let svc = state.networks.require(&name)?;
    svc.set_threshold(req.threshold)?;
    info!(
        target: "volition::api",
        "[API] Threshold for {} set to {}",
        name, req.threshold
    );
    Ok(StatusCode::NO_CONTENT)
}

/// POST /networks/:name/urls
pub async fn add_urls(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(req): Json<UrlsUpdate>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let svc = state.networks.require(&name)?;
    let added = svc.add_urls(&req.urls);
    Ok(Json(json!({ "added": added, "known": svc.miners().urls.len() })))
}
