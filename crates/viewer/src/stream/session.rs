//! Connection lifecycle of one camera.
//!
//! ```text
//! Idle -> Connecting -> Streaming -> (read failure, cooldown) -> Connecting -> ...
//!            |              |
//!            |              +-> Failed(Streaming)   only with a reconnect cap
//!            +-> Failed(Connecting)                 initial connect exhausted
//! any state -> Stopped
//! ```
//!
//! Each session runs two tasks: the stream loop and a one-off PTZ setup.
//! Neither ever waits on another camera.

use common::{CameraError, CameraProfile, Frame, RetryExhausted, RetryPolicy, ValidationError};
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::frame_source::{FrameSource, FrameStream};
use crate::metrics::{CONNECT_FAILURES_TOTAL, FRAMES_TOTAL, RECONNECTS_TOTAL, SESSIONS_STREAMING};
use crate::ptz::{PtzChannel, PtzConnector, PtzDirection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePhase {
    Connecting,
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    Failed(FailurePhase),
    Stopped,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Streaming => "streaming",
            SessionState::Failed(FailurePhase::Connecting) => "failed_connecting",
            SessionState::Failed(FailurePhase::Streaming) => "failed_streaming",
            SessionState::Stopped => "stopped",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SessionState::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Reconnect cycles since the session started
    pub reconnects: u32,
    pub last_error: Option<String>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            reconnects: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Opening the frame source
    pub connect_retry: RetryPolicy,
    /// ONVIF service discovery and profile lookup
    pub onvif_retry: RetryPolicy,
    /// Pause between a stream failure and the next connect
    pub reconnect_cooldown: Duration,
    /// Longest wait for a single frame before the stream counts as failed
    pub read_timeout: Duration,
    /// Reconnect cycles allowed after the first successful connect; `None`
    /// retries forever
    pub max_reconnects: Option<u32>,
    /// How long `stop` waits for each task before aborting it
    pub stop_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_retry: RetryPolicy::default(),
            onvif_retry: RetryPolicy::default(),
            reconnect_cooldown: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            max_reconnects: None,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Receives a session's output. Called from the session's own task.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    async fn on_frame(&self, camera: &str, frame: Frame);

    async fn on_error(&self, camera: &str, error: &CameraError);

    async fn on_state(&self, camera: &str, status: &SessionStatus);
}

/// Collaborators a session is started with.
#[derive(Clone)]
pub struct SessionContext {
    pub source: Arc<dyn FrameSource>,
    pub ptz: Arc<dyn PtzConnector>,
    pub observer: Arc<dyn SessionObserver>,
    /// Caps how many sessions are opening their stream at once
    pub setup_permits: Option<Arc<Semaphore>>,
}

struct Shared {
    camera: String,
    profile: Arc<CameraProfile>,
    settings: SessionSettings,
    ctx: SessionContext,
    status: watch::Sender<SessionStatus>,
    ptz: RwLock<Option<Box<dyn PtzChannel>>>,
}

pub struct CameraSession {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CameraSession {
    pub fn new(profile: Arc<CameraProfile>, settings: SessionSettings, ctx: SessionContext) -> Self {
        let (status, _) = watch::channel(SessionStatus::default());
        Self {
            shared: Arc::new(Shared {
                camera: profile.identity().to_string(),
                profile,
                settings,
                ctx,
                status,
                ptz: RwLock::new(None),
            }),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn identity(&self) -> &str {
        &self.shared.camera
    }

    pub fn profile(&self) -> &Arc<CameraProfile> {
        &self.shared.profile
    }

    /// Spawn the stream loop and PTZ setup. Returns immediately; calling it
    /// again, or after `stop`, does nothing.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if !tasks.is_empty() || self.cancel.is_cancelled() {
            return;
        }

        let span = info_span!("session", camera = %self.shared.camera);
        tasks.push(tokio::spawn(
            run_stream(Arc::clone(&self.shared), self.cancel.clone()).instrument(span.clone()),
        ));
        tasks.push(tokio::spawn(
            setup_ptz(Arc::clone(&self.shared), self.cancel.clone()).instrument(span),
        ));
    }

    /// Stop both tasks, release every handle and enter `Stopped`.
    ///
    /// Waits at most `stop_timeout` per task; a task that does not observe
    /// the stop signal in time is aborted, which drops its handles.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for mut task in tasks {
            if tokio::time::timeout(self.shared.settings.stop_timeout, &mut task)
                .await
                .is_err()
            {
                warn!(camera = %self.shared.camera, "session task did not stop in time, aborting");
                task.abort();
            }
        }

        self.shared.ptz.write().await.take();
        self.shared.set_state(SessionState::Stopped).await;
        debug!(camera = %self.shared.camera, "session stopped");
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status.subscribe()
    }

    pub async fn ptz_available(&self) -> bool {
        self.shared.ptz.read().await.is_some()
    }

    /// Start a continuous pan/tilt move. Fails when PTZ setup has not
    /// succeeded or the camera rejects the command; neither affects the stream.
    pub async fn move_camera(&self, direction: PtzDirection, speed: f32) -> Result<(), CameraError> {
        if !(speed.is_finite() && speed > 0.0 && speed <= 1.0) {
            return Err(ValidationError::new("speed", format!("must be in (0, 1], got {speed}")).into());
        }

        let guard = self.shared.ptz.read().await;
        let channel = guard.as_ref().ok_or_else(ptz_unavailable)?;
        channel
            .continuous_move(direction.velocity(speed))
            .await
            .map_err(|e| {
                warn!(camera = %self.shared.camera, ?direction, error = %e, "ptz move failed");
                CameraError::PtzCommand(format!("{e:#}"))
            })
    }

    /// Stop all axes.
    pub async fn stop_move(&self) -> Result<(), CameraError> {
        let guard = self.shared.ptz.read().await;
        let channel = guard.as_ref().ok_or_else(ptz_unavailable)?;
        channel.stop().await.map_err(|e| {
            warn!(camera = %self.shared.camera, error = %e, "ptz stop failed");
            CameraError::PtzCommand(format!("{e:#}"))
        })
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn ptz_unavailable() -> CameraError {
    CameraError::PtzCommand("ptz control not available for this camera".to_string())
}

impl Shared {
    fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    async fn set_state(&self, state: SessionState) {
        let mut previous = state;
        self.status.send_modify(|s| {
            previous = s.state;
            s.state = state;
        });
        if previous == state {
            return;
        }

        if previous == SessionState::Streaming {
            SESSIONS_STREAMING.dec();
        } else if state == SessionState::Streaming {
            SESSIONS_STREAMING.inc();
        }

        debug!(from = %previous, to = %state, "session state changed");
        let status = self.status.borrow().clone();
        self.ctx.observer.on_state(&self.camera, &status).await;
    }

    async fn report(&self, err: CameraError) {
        let message = err.to_string();
        self.status.send_modify(|s| s.last_error = Some(message));
        self.ctx.observer.on_error(&self.camera, &err).await;
    }

    /// `None` when cancelled before the connect finished.
    async fn connect(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Option<Result<Box<dyn FrameStream>, RetryExhausted>> {
        let attempt = async {
            let _permit = match &self.ctx.setup_permits {
                Some(permits) => Arc::clone(permits).acquire_owned().await.ok(),
                None => None,
            };
            let source = Arc::clone(&self.ctx.source);
            self.settings
                .connect_retry
                .run("open frame source", || {
                    let source = Arc::clone(&source);
                    let url = url.to_string();
                    async move { source.open(&url).await }
                })
                .await
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = attempt => Some(result),
        }
    }

    /// Read frames until the stream fails (`Some`) or the session is
    /// cancelled (`None`).
    async fn pump(&self, stream: &mut dyn FrameStream, cancel: &CancellationToken) -> Option<CameraError> {
        let read_timeout = self.settings.read_timeout;
        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                read = tokio::time::timeout(read_timeout, stream.read()) => read,
            };

            match read {
                Ok(Ok(frame)) => {
                    FRAMES_TOTAL.inc();
                    self.ctx.observer.on_frame(&self.camera, frame).await;
                }
                Ok(Err(e)) => return Some(CameraError::StreamRead(format!("{e:#}"))),
                Err(_) => {
                    return Some(CameraError::StreamRead(format!(
                        "no frame within {read_timeout:?}"
                    )))
                }
            }
        }
    }

    /// Wait out the cooldown before another connect. `false` means the loop
    /// must end: cancelled, or the reconnect cap was reached.
    async fn back_off(&self, cancel: &CancellationToken) -> bool {
        let reconnects = self.status.borrow().reconnects;
        if let Some(max) = self.settings.max_reconnects {
            if reconnects >= max {
                error!(reconnects, "reconnect limit reached, giving up");
                self.set_state(SessionState::Failed(FailurePhase::Streaming)).await;
                return false;
            }
        }

        let cancelled = tokio::select! {
            biased;
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(self.settings.reconnect_cooldown) => false,
        };
        if cancelled {
            return false;
        }

        self.status.send_modify(|s| s.reconnects += 1);
        RECONNECTS_TOTAL.inc();
        true
    }
}

async fn run_stream(shared: Arc<Shared>, cancel: CancellationToken) {
    let url = shared.profile.connection_url();
    info!(url = %shared.profile.redacted_url(), "session starting");
    let mut connected_once = false;

    loop {
        shared.set_state(SessionState::Connecting).await;

        let Some(opened) = shared.connect(&url, &cancel).await else {
            return;
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(exhausted) => {
                CONNECT_FAILURES_TOTAL.inc();
                error!(error = %exhausted, "could not open stream");
                shared.report(exhausted.into()).await;
                if !connected_once {
                    shared.set_state(SessionState::Failed(FailurePhase::Connecting)).await;
                    return;
                }
                if !shared.back_off(&cancel).await {
                    return;
                }
                continue;
            }
        };

        connected_once = true;
        shared.set_state(SessionState::Streaming).await;
        info!("streaming");

        let failure = shared.pump(stream.as_mut(), &cancel).await;
        stream.release().await;

        let Some(failure) = failure else {
            return;
        };
        warn!(error = %failure, "stream failed, reconnecting");
        shared.report(failure).await;
        // the stream is gone, so the cooldown already counts as reconnecting
        shared.set_state(SessionState::Connecting).await;

        if !shared.back_off(&cancel).await {
            return;
        }
    }
}

async fn setup_ptz(shared: Arc<Shared>, cancel: CancellationToken) {
    let connector = Arc::clone(&shared.ctx.ptz);
    let profile = Arc::clone(&shared.profile);
    let attempt = shared.settings.onvif_retry.run("onvif setup", || {
        let connector = Arc::clone(&connector);
        let profile = Arc::clone(&profile);
        async move { connector.setup(&profile).await }
    });

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        result = attempt => result,
    };

    match result {
        Ok(channel) => {
            info!(token = %channel.profile_token(), "ptz control available");
            *shared.ptz.write().await = Some(channel);
        }
        Err(e) => warn!(error = %e, "ptz control unavailable"),
    }
}
