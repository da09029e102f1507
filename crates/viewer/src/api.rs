//! HTTP control surface: the camera list, snapshots, recording and PTZ
//! buttons, and the configuration editor.

mod dto;
mod error;
mod routes;

use axum::routing::{get, post};
use axum::Router;
use common::config_store::ConfigStore;
use std::sync::Arc;
use telemetry::RequestIdLayer;

pub use dto::{CameraDto, PtzMoveRequest, ReconnectResponse, RecordingAction, RecordingResponse};
pub use error::ApiError;

use crate::board::FrameBoard;
use crate::stream::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub board: Arc<FrameBoard>,
    pub store: ConfigStore,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(routes::healthz))
        .route("/cameras", get(routes::list_cameras))
        .route("/cameras/:ip/snapshot", get(routes::snapshot))
        .route("/cameras/:ip/recording/toggle", post(routes::toggle_recording))
        .route("/cameras/:ip/recording/start", post(routes::start_recording))
        .route("/cameras/:ip/recording/stop", post(routes::stop_recording))
        .route("/cameras/:ip/ptz/move", post(routes::ptz_move))
        .route("/cameras/:ip/ptz/stop", post(routes::ptz_stop))
        .route("/cameras/:ip/reconnect", post(routes::reconnect))
        .route("/config", get(routes::get_config).put(routes::put_config))
        .route("/metrics", get(routes::render_metrics))
        .layer(RequestIdLayer::new())
        .with_state(state)
}
