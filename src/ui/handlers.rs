//! HTTP API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::PairingError;
use crate::playback::{MeasureMap, PlaybackSnapshot, RemoteCommand, SongMeta};
use crate::session::{CoordinatorStatus, DeviceSummary, RttReport};
use crate::ui::server::{AppState, PendingRequest};

/// API response wrapper
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

type ApiResult<T> = (StatusCode, Json<ApiResponse<T>>);

fn ok<T>(data: T) -> ApiResult<T> {
    (StatusCode::OK, Json(ApiResponse::ok(data)))
}

fn failure<T>(error: PairingError) -> ApiResult<T> {
    let status = match error {
        PairingError::UnknownDevice(_) | PairingError::UnknownRequest(_) => StatusCode::NOT_FOUND,
        PairingError::NotPaired(_) | PairingError::NoPairedDevice => StatusCode::CONFLICT,
        PairingError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(ApiResponse::error(error.to_string())))
}

/// Coordinator status
pub async fn get_status(State(state): State<Arc<AppState>>) -> ApiResult<CoordinatorStatus> {
    match state.coordinator.status().await {
        Ok(status) => ok(status),
        Err(e) => failure(e),
    }
}

/// Devices seen through discovery or connections
pub async fn get_devices(State(state): State<Arc<AppState>>) -> ApiResult<Vec<DeviceSummary>> {
    match state.coordinator.status().await {
        Ok(status) => ok(status.devices),
        Err(e) => failure(e),
    }
}

pub async fn pair_device(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<()> {
    match state.coordinator.pair_with(&id).await {
        Ok(()) => ok(()),
        Err(e) => failure(e),
    }
}

pub async fn cancel_pairing(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<()> {
    match state.coordinator.cancel_pairing(&id).await {
        Ok(()) => ok(()),
        Err(e) => failure(e),
    }
}

pub async fn disconnect(State(state): State<Arc<AppState>>) -> ApiResult<()> {
    match state.coordinator.disconnect().await {
        Ok(()) => ok(()),
        Err(e) => failure(e),
    }
}

pub async fn get_pairing_requests(State(state): State<Arc<AppState>>) -> ApiResult<Vec<PendingRequest>> {
    ok(state.pending_requests())
}

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub accept: bool,
}

/// Accept or reject a pending pairing request
pub async fn decide_pairing(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(req): Json<DecisionRequest>,
) -> ApiResult<()> {
    let Some(ticket) = state.take_ticket(id) else {
        return failure(PairingError::UnknownRequest(id));
    };
    match state.coordinator.decide_pairing(ticket, req.accept).await {
        Ok(()) => ok(()),
        Err(e) => failure(e),
    }
}

pub async fn get_rtt(State(state): State<Arc<AppState>>) -> ApiResult<Vec<RttReport>> {
    match state.coordinator.status().await {
        Ok(status) => ok(status.rtt),
        Err(e) => failure(e),
    }
}

pub async fn get_playback(State(state): State<Arc<AppState>>) -> ApiResult<Option<PlaybackSnapshot>> {
    ok(state.latest_playback())
}

/// Takes the same JSON a paired device sends, e.g. `{"type": "play"}`
pub async fn playback_command(
    State(state): State<Arc<AppState>>,
    Json(command): Json<RemoteCommand>,
) -> ApiResult<bool> {
    match state.apply_command(command).await {
        Ok(changed) => ok(changed),
        Err(e) => failure(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSongRequest {
    #[serde(flatten)]
    pub song: SongMeta,
    /// Measure lengths in quarter notes
    #[serde(default)]
    pub measures: Vec<f64>,
}

pub async fn load_song(State(state): State<Arc<AppState>>, Json(req): Json<LoadSongRequest>) -> ApiResult<()> {
    if state.load_song(req.song, MeasureMap::from_lengths(&req.measures)) {
        (StatusCode::CREATED, Json(ApiResponse::ok(())))
    } else {
        (
            StatusCode::CONFLICT,
            Json(ApiResponse::error("Playback is controlled by the paired presenter")),
        )
    }
}

pub async fn unload_song(State(state): State<Arc<AppState>>) -> ApiResult<()> {
    if state.unload_song() {
        ok(())
    } else {
        (
            StatusCode::CONFLICT,
            Json(ApiResponse::error("Playback is controlled by the paired presenter")),
        )
    }
}
