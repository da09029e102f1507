//! Live camera streams: frame sources, per-camera sessions and the registry
//! that owns them.

pub mod events;
pub mod frame_source;
pub mod registry;
pub mod session;

pub use events::{CameraEvent, ChannelConsumer, EventConsumer};
pub use frame_source::{FfmpegFrameSource, FrameSource, FrameStream, MockFrameSource, StreamPlan};
pub use registry::{AttachReport, CameraSummary, RegistrySettings, RejectedCamera, SessionRegistry};
pub use session::{
    CameraSession, FailurePhase, SessionContext, SessionObserver, SessionSettings, SessionState,
    SessionStatus,
};
