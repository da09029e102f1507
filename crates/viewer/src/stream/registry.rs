//! The fleet of camera sessions.
//!
//! The registry is the only publisher of camera events. Structural changes
//! (`attach`, `replace`, `reconnect`, `detach_all`) take the fleet write
//! lock; commands against a camera take the read lock, so a command never
//! lands on a session that is being torn down.

use async_trait::async_trait;
use common::{CameraError, CameraProfile, Frame};
use futures::future::join_all;
use recorder::{FrameOutcome, RecordingController, RecordingStatus, RecordingSummary, ToggleOutcome};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, warn};

use super::events::EventConsumer;
use super::frame_source::FrameSource;
use super::session::{CameraSession, SessionContext, SessionObserver, SessionSettings, SessionStatus};
use crate::metrics::{RECORDINGS_ACTIVE, RECORDING_ROTATIONS_TOTAL};
use crate::ptz::{PtzConnector, PtzDirection, DEFAULT_PTZ_SPEED};

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub session: SessionSettings,
    /// Sessions allowed in their connect phase at once; `None` means no cap
    pub setup_parallelism: Option<usize>,
    /// Replace a failed session automatically after this delay
    pub auto_reconnect_after: Option<Duration>,
    /// Speed used when a move command does not name one
    pub ptz_speed: f32,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            session: SessionSettings::default(),
            setup_parallelism: None,
            auto_reconnect_after: None,
            ptz_speed: DEFAULT_PTZ_SPEED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedCamera {
    pub camera: String,
    pub reason: String,
}

/// Outcome of attaching a set of profiles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AttachReport {
    pub started: Vec<String>,
    pub rejected: Vec<RejectedCamera>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraSummary {
    pub camera: String,
    /// Connection URL with the password masked
    pub url: String,
    pub state: String,
    pub reconnects: u32,
    pub last_error: Option<String>,
    pub ptz_available: bool,
    pub recording: Option<RecordingStatus>,
}

#[derive(Default)]
struct Fleet {
    /// Attach order
    profiles: Vec<Arc<CameraProfile>>,
    sessions: HashMap<String, Arc<CameraSession>>,
}

struct RegistryInner {
    fleet: RwLock<Fleet>,
    source: Arc<dyn FrameSource>,
    connector: Arc<dyn PtzConnector>,
    recorder: Arc<RecordingController>,
    consumer: Arc<dyn EventConsumer>,
    settings: RegistrySettings,
    permits: Option<Arc<Semaphore>>,
    /// Bumped by every teardown; stale auto-reconnects compare against it
    generation: AtomicU64,
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(
        source: Arc<dyn FrameSource>,
        connector: Arc<dyn PtzConnector>,
        recorder: Arc<RecordingController>,
        consumer: Arc<dyn EventConsumer>,
        settings: RegistrySettings,
    ) -> Self {
        let permits = settings
            .setup_parallelism
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        Self {
            inner: Arc::new(RegistryInner {
                fleet: RwLock::new(Fleet::default()),
                source,
                connector,
                recorder,
                consumer,
                settings,
                permits,
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn recorder(&self) -> &Arc<RecordingController> {
        &self.inner.recorder
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.inner.settings
    }

    /// Start one session per profile and return without waiting for any of
    /// them to connect. Invalid or duplicate profiles are rejected one by
    /// one; the rest still start.
    pub async fn attach(&self, profiles: Vec<CameraProfile>) -> AttachReport {
        let mut fleet = self.inner.fleet.write().await;
        self.attach_locked(&mut fleet, profiles).await
    }

    /// Tear down every session and recording, then attach `profiles`.
    pub async fn replace(&self, profiles: Vec<CameraProfile>) -> AttachReport {
        let mut fleet = self.inner.fleet.write().await;
        let stopped = self.teardown_locked(&mut fleet).await;
        info!(stopped, cameras = profiles.len(), "replacing camera configuration");
        self.attach_locked(&mut fleet, profiles).await
    }

    /// Stop every session and recording. Returns how many sessions were
    /// stopped.
    pub async fn detach_all(&self) -> usize {
        let mut fleet = self.inner.fleet.write().await;
        let stopped = self.teardown_locked(&mut fleet).await;
        info!(stopped, "all cameras detached");
        stopped
    }

    /// Replace a failed session with a fresh one for the same profile.
    /// Returns `false` when the session is not failed.
    pub async fn reconnect(&self, identity: &str) -> Result<bool, CameraError> {
        let mut fleet = self.inner.fleet.write().await;
        let session = fleet
            .sessions
            .get(identity)
            .cloned()
            .ok_or_else(|| CameraError::not_found(identity))?;

        if !session.state().is_failed() {
            debug!(camera = %identity, state = %session.state(), "reconnect ignored, session not failed");
            return Ok(false);
        }

        session.stop().await;
        let fresh = Arc::new(self.new_session(Arc::clone(session.profile())));
        fresh.start();
        fleet.sessions.insert(identity.to_string(), fresh);

        info!(camera = %identity, "session restarted");
        Ok(true)
    }

    pub async fn ptz_move(
        &self,
        identity: &str,
        direction: PtzDirection,
        speed: Option<f32>,
    ) -> Result<(), CameraError> {
        let speed = speed.unwrap_or(self.inner.settings.ptz_speed);
        let fleet = self.inner.fleet.read().await;
        let session = session_of(&fleet, identity)?;
        info!(camera = %identity, ?direction, speed, "ptz move");
        session.move_camera(direction, speed).await
    }

    pub async fn ptz_stop(&self, identity: &str) -> Result<(), CameraError> {
        let fleet = self.inner.fleet.read().await;
        let session = session_of(&fleet, identity)?;
        info!(camera = %identity, "ptz stop");
        session.stop_move().await
    }

    pub async fn toggle_recording(&self, identity: &str) -> Result<ToggleOutcome, CameraError> {
        let fleet = self.inner.fleet.read().await;
        session_of(&fleet, identity)?;
        let outcome = self.inner.recorder.toggle(identity).await;
        self.refresh_recordings_gauge().await;
        outcome
    }

    pub async fn start_recording(&self, identity: &str) -> Result<Option<PathBuf>, CameraError> {
        let fleet = self.inner.fleet.read().await;
        session_of(&fleet, identity)?;
        let started = self.inner.recorder.start(identity).await;
        self.refresh_recordings_gauge().await;
        started
    }

    pub async fn stop_recording(&self, identity: &str) -> Result<Option<RecordingSummary>, CameraError> {
        let fleet = self.inner.fleet.read().await;
        session_of(&fleet, identity)?;
        let stopped = self.inner.recorder.stop(identity).await;
        self.refresh_recordings_gauge().await;
        stopped
    }

    /// Every camera in attach order.
    pub async fn cameras(&self) -> Vec<CameraSummary> {
        let fleet = self.inner.fleet.read().await;
        let mut out = Vec::with_capacity(fleet.profiles.len());
        for profile in &fleet.profiles {
            if let Some(session) = fleet.sessions.get(profile.identity()) {
                out.push(self.summarize(session).await);
            }
        }
        out
    }

    pub async fn status(&self, identity: &str) -> Result<CameraSummary, CameraError> {
        let fleet = self.inner.fleet.read().await;
        let session = session_of(&fleet, identity)?;
        Ok(self.summarize(session).await)
    }

    pub async fn session_status(&self, identity: &str) -> Result<SessionStatus, CameraError> {
        let fleet = self.inner.fleet.read().await;
        Ok(session_of(&fleet, identity)?.status())
    }

    /// Profiles of the attached cameras, in attach order.
    pub async fn profiles(&self) -> Vec<CameraProfile> {
        let fleet = self.inner.fleet.read().await;
        fleet.profiles.iter().map(|p| CameraProfile::clone(p)).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.fleet.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn attach_locked(&self, fleet: &mut Fleet, profiles: Vec<CameraProfile>) -> AttachReport {
        let mut report = AttachReport::default();

        for profile in profiles {
            let identity = profile.identity().to_string();

            if let Err(e) = profile.validate() {
                warn!(camera = %identity, error = %e, "camera rejected");
                report.rejected.push(RejectedCamera {
                    camera: identity,
                    reason: e.to_string(),
                });
                continue;
            }
            if fleet.sessions.contains_key(&identity) {
                warn!(camera = %identity, "camera rejected, identity already attached");
                report.rejected.push(RejectedCamera {
                    camera: identity,
                    reason: "duplicate camera identity".to_string(),
                });
                continue;
            }

            let profile = Arc::new(profile);
            self.inner
                .recorder
                .register(&identity, profile.connection_url())
                .await;

            let session = Arc::new(self.new_session(Arc::clone(&profile)));
            session.start();

            fleet.profiles.push(profile);
            fleet.sessions.insert(identity.clone(), session);
            report.started.push(identity);
        }

        info!(
            started = report.started.len(),
            rejected = report.rejected.len(),
            "cameras attached"
        );
        report
    }

    async fn teardown_locked(&self, fleet: &mut Fleet) -> usize {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        let sessions: Vec<(String, Arc<CameraSession>)> = fleet.sessions.drain().collect();
        fleet.profiles.clear();

        join_all(sessions.iter().map(|(_, session)| session.stop())).await;

        let aborted = self.inner.recorder.reset_all().await;
        if aborted > 0 {
            warn!(aborted, "in-progress recordings terminated by teardown");
        }
        RECORDINGS_ACTIVE.set(0);

        for (identity, _) in &sessions {
            self.inner.consumer.on_detach(identity);
        }
        sessions.len()
    }

    fn new_session(&self, profile: Arc<CameraProfile>) -> CameraSession {
        let fanout = Fanout {
            registry: Arc::downgrade(&self.inner),
            generation: self.inner.generation.load(Ordering::SeqCst),
            recorder: Arc::clone(&self.inner.recorder),
            consumer: Arc::clone(&self.inner.consumer),
            auto_reconnect_after: self.inner.settings.auto_reconnect_after,
        };
        let ctx = SessionContext {
            source: Arc::clone(&self.inner.source),
            ptz: Arc::clone(&self.inner.connector),
            observer: Arc::new(fanout),
            setup_permits: self.inner.permits.clone(),
        };
        CameraSession::new(profile, self.inner.settings.session.clone(), ctx)
    }

    async fn summarize(&self, session: &CameraSession) -> CameraSummary {
        let status = session.status();
        CameraSummary {
            camera: session.identity().to_string(),
            url: session.profile().redacted_url(),
            state: status.state.to_string(),
            reconnects: status.reconnects,
            last_error: status.last_error,
            ptz_available: session.ptz_available().await,
            recording: self.inner.recorder.status(session.identity()).await.ok(),
        }
    }

    async fn refresh_recordings_gauge(&self) {
        refresh_recordings_gauge(&self.inner.recorder).await;
    }
}

fn session_of<'a>(fleet: &'a Fleet, identity: &str) -> Result<&'a Arc<CameraSession>, CameraError> {
    fleet
        .sessions
        .get(identity)
        .ok_or_else(|| CameraError::not_found(identity))
}

async fn refresh_recordings_gauge(recorder: &RecordingController) {
    let active = recorder.list().await.iter().filter(|s| s.recording).count();
    RECORDINGS_ACTIVE.set(active as i64);
}

/// Routes one session's output to the recorder and the registry's consumer.
struct Fanout {
    registry: Weak<RegistryInner>,
    generation: u64,
    recorder: Arc<RecordingController>,
    consumer: Arc<dyn EventConsumer>,
    auto_reconnect_after: Option<Duration>,
}

impl Fanout {
    fn schedule_reconnect(&self, camera: &str, delay: Duration) {
        let registry = self.registry.clone();
        let generation = self.generation;
        let camera = camera.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = registry.upgrade() else {
                return;
            };
            if inner.generation.load(Ordering::SeqCst) != generation {
                debug!(camera = %camera, "configuration changed, skipping automatic reconnect");
                return;
            }
            let registry = SessionRegistry { inner };
            match registry.reconnect(&camera).await {
                Ok(true) => info!(camera = %camera, "automatic reconnect"),
                Ok(false) => {}
                Err(e) => debug!(camera = %camera, error = %e, "automatic reconnect skipped"),
            }
        });
    }
}

#[async_trait]
impl SessionObserver for Fanout {
    async fn on_frame(&self, camera: &str, frame: Frame) {
        match self.recorder.on_frame(camera, &frame).await {
            Ok(FrameOutcome::Rotated) => RECORDING_ROTATIONS_TOTAL.inc(),
            Ok(_) => {}
            Err(e) => {
                self.consumer.on_error(camera, &e.to_string());
                refresh_recordings_gauge(&self.recorder).await;
            }
        }
        self.consumer.on_frame(camera, &frame);
    }

    async fn on_error(&self, camera: &str, error: &CameraError) {
        self.consumer.on_error(camera, &error.to_string());
    }

    async fn on_state(&self, camera: &str, status: &SessionStatus) {
        self.consumer.on_state(camera, status.state);

        if status.state.is_failed() {
            if let Some(delay) = self.auto_reconnect_after {
                info!(camera = %camera, delay_secs = delay.as_secs(), "scheduling automatic reconnect");
                self.schedule_reconnect(camera, delay);
            }
        }
    }
}
