//! camwall: a headless wall of RTSP cameras with ONVIF pan/tilt control and
//! on-demand recording.

pub mod api;
pub mod board;
pub mod config;
pub mod metrics;
pub mod ptz;
pub mod stream;

use std::sync::Arc;

use recorder::{RecordingController, SinkFactory};

use crate::config::Config;
use crate::ptz::PtzConnector;
use crate::stream::{EventConsumer, FrameSource, SessionRegistry};

/// Assemble a registry from runtime configuration and the given collaborators.
pub fn build_registry(
    config: &Config,
    source: Arc<dyn FrameSource>,
    connector: Arc<dyn PtzConnector>,
    sinks: Arc<dyn SinkFactory>,
    consumer: Arc<dyn EventConsumer>,
) -> SessionRegistry {
    let recorder = Arc::new(RecordingController::new(sinks, config.recorder_settings()));
    SessionRegistry::new(source, connector, recorder, consumer, config.registry_settings())
}
