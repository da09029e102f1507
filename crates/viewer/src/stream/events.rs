use common::Frame;
use tokio::sync::mpsc;
use tracing::warn;

use super::session::SessionState;
use crate::metrics::FRAMES_DROPPED_TOTAL;

/// Receives everything the registry publishes. Every call names the camera.
///
/// Calls come from the cameras' own tasks, so implementations must return
/// quickly and must not block.
pub trait EventConsumer: Send + Sync {
    fn on_frame(&self, camera: &str, frame: &Frame);

    fn on_error(&self, camera: &str, message: &str);

    fn on_state(&self, _camera: &str, _state: SessionState) {}

    /// The camera's session was torn down.
    fn on_detach(&self, _camera: &str) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum CameraEvent {
    Frame { camera: String, frame: Frame },
    Error { camera: String, message: String },
    State { camera: String, state: SessionState },
    Detached { camera: String },
}

impl CameraEvent {
    pub fn camera(&self) -> &str {
        match self {
            CameraEvent::Frame { camera, .. }
            | CameraEvent::Error { camera, .. }
            | CameraEvent::State { camera, .. }
            | CameraEvent::Detached { camera } => camera,
        }
    }
}

/// Forwards events into a bounded channel. Frames are dropped while the
/// receiver is behind; other events are only dropped when the channel is
/// closed or still full.
#[derive(Clone)]
pub struct ChannelConsumer {
    tx: mpsc::Sender<CameraEvent>,
}

impl ChannelConsumer {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<CameraEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    fn forward(&self, event: CameraEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let event = match e {
                mpsc::error::TrySendError::Full(ev) | mpsc::error::TrySendError::Closed(ev) => ev,
            };
            if matches!(event, CameraEvent::Frame { .. }) {
                FRAMES_DROPPED_TOTAL.inc();
            } else {
                warn!(camera = %event.camera(), "event consumer unavailable, dropping event");
            }
        }
    }
}

impl EventConsumer for ChannelConsumer {
    fn on_frame(&self, camera: &str, frame: &Frame) {
        self.forward(CameraEvent::Frame {
            camera: camera.to_string(),
            frame: frame.clone(),
        });
    }

    fn on_error(&self, camera: &str, message: &str) {
        self.forward(CameraEvent::Error {
            camera: camera.to_string(),
            message: message.to_string(),
        });
    }

    fn on_state(&self, camera: &str, state: SessionState) {
        self.forward(CameraEvent::State {
            camera: camera.to_string(),
            state,
        });
    }

    fn on_detach(&self, camera: &str) {
        self.forward(CameraEvent::Detached {
            camera: camera.to_string(),
        });
    }
}
