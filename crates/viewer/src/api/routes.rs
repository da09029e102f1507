use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use common::config_store;
use common::profile::Mapping;
use recorder::ToggleOutcome;
use std::path::PathBuf;
use tracing::info;

use super::dto::{
    CameraDto, PtzMoveRequest, ReconnectResponse, RecordingAction, RecordingResponse,
};
use super::error::ApiError;
use super::AppState;
use crate::metrics;
use crate::stream::AttachReport;

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn list_cameras(State(state): State<AppState>) -> Json<Vec<CameraDto>> {
    let cameras = state
        .registry
        .cameras()
        .await
        .into_iter()
        .map(|summary| CameraDto {
            frames_seen: state
                .board
                .view(&summary.camera)
                .map(|v| v.frames_seen)
                .unwrap_or(0),
            summary,
        })
        .collect();
    Json(cameras)
}

/// GET /cameras/:ip/snapshot - latest frame as JPEG
pub async fn snapshot(State(state): State<AppState>, Path(ip): Path<String>) -> Result<Response, ApiError> {
    state.registry.status(&ip).await?;
    match state.board.snapshot_jpeg(&ip)? {
        Some(jpeg) => Ok(([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response()),
        None => Err(ApiError::Unavailable(format!("no frame received from {ip} yet"))),
    }
}

pub async fn toggle_recording(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<Json<RecordingResponse>, ApiError> {
    let response = match state.registry.toggle_recording(&ip).await? {
        ToggleOutcome::Started(file) => started(ip, Some(file)),
        ToggleOutcome::Stopped(summary) => stopped(ip, summary),
    };
    Ok(Json(response))
}

pub async fn start_recording(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<Json<RecordingResponse>, ApiError> {
    let file = state.registry.start_recording(&ip).await?;
    Ok(Json(started(ip, file)))
}

pub async fn stop_recording(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<Json<RecordingResponse>, ApiError> {
    let summary = state.registry.stop_recording(&ip).await?;
    Ok(Json(stopped(ip, summary)))
}

fn started(camera: String, file: Option<PathBuf>) -> RecordingResponse {
    RecordingResponse {
        camera,
        action: if file.is_some() {
            RecordingAction::Started
        } else {
            RecordingAction::Unchanged
        },
        recording: true,
        file: file.map(|f| f.to_string_lossy().to_string()),
        summary: None,
    }
}

fn stopped(camera: String, summary: Option<recorder::RecordingSummary>) -> RecordingResponse {
    RecordingResponse {
        camera,
        action: if summary.is_some() {
            RecordingAction::Stopped
        } else {
            RecordingAction::Unchanged
        },
        recording: false,
        file: summary.as_ref().map(|s| s.file.to_string_lossy().to_string()),
        summary: summary.map(Into::into),
    }
}

pub async fn ptz_move(
    State(state): State<AppState>,
    Path(ip): Path<String>,
    Json(req): Json<PtzMoveRequest>,
) -> Result<StatusCode, ApiError> {
    state.registry.ptz_move(&ip, req.direction, req.speed).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn ptz_stop(State(state): State<AppState>, Path(ip): Path<String>) -> Result<StatusCode, ApiError> {
    state.registry.ptz_stop(&ip).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn reconnect(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<Json<ReconnectResponse>, ApiError> {
    let restarted = state.registry.reconnect(&ip).await?;
    Ok(Json(ReconnectResponse { camera: ip, restarted }))
}

/// GET /config - the running camera list in its stored form
pub async fn get_config(State(state): State<AppState>) -> Json<Vec<Mapping>> {
    let profiles = state.registry.profiles().await;
    Json(profiles.iter().map(|p| p.to_mapping()).collect())
}

/// PUT /config - validate, persist, then swap the running fleet
pub async fn put_config(
    State(state): State<AppState>,
    Json(entries): Json<Vec<Mapping>>,
) -> Result<Json<AttachReport>, ApiError> {
    let profiles = config_store::parse_all(&entries)?;
    state.store.save(&profiles).await?;
    info!(cameras = profiles.len(), "camera configuration updated");
    Ok(Json(state.registry.replace(profiles).await))
}

pub async fn render_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}
