use recorder::RecordingSummary;
use serde::{Deserialize, Serialize};

use crate::ptz::PtzDirection;
use crate::stream::CameraSummary;

#[derive(Debug, Deserialize)]
pub struct PtzMoveRequest {
    pub direction: PtzDirection,
    /// Falls back to the configured default speed
    #[serde(default)]
    pub speed: Option<f32>,
}

#[derive(Debug, Serialize)]
pub struct CameraDto {
    #[serde(flatten)]
    pub summary: CameraSummary,
    pub frames_seen: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingAction {
    Started,
    Stopped,
    /// The camera was already in the requested state
    Unchanged,
}

#[derive(Debug, Serialize)]
pub struct RecordingResponse {
    pub camera: String,
    pub action: RecordingAction,
    pub recording: bool,
    pub file: Option<String>,
    pub summary: Option<RecordingSummaryDto>,
}

#[derive(Debug, Serialize)]
pub struct RecordingSummaryDto {
    pub file: String,
    pub duration_secs: f64,
    pub frame_count: u64,
    pub size_bytes: u64,
}

impl From<RecordingSummary> for RecordingSummaryDto {
    fn from(s: RecordingSummary) -> Self {
        Self {
            file: s.file.to_string_lossy().to_string(),
            duration_secs: s.duration.as_secs_f64(),
            frame_count: s.frame_count,
            size_bytes: s.size_bytes,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReconnectResponse {
    pub camera: String,
    pub restarted: bool,
}
