//! On-demand recording of camera streams to MP4 files.

pub mod recording;

pub use recording::controller::{
  FrameOutcome, RecorderSettings, RecordingController, RecordingStatus, RecordingSummary,
  ToggleOutcome, MAX_RECORDING_DURATION,
};
pub use recording::pipeline::{FfmpegSinkFactory, RecordingMode};
pub use recording::sink::{MemorySinkFactory, RecordingSink, SinkFactory, SinkRequest};
