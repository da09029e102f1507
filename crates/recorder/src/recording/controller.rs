use common::{CameraError, Frame};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::sink::{RecordingSink, SinkFactory, SinkRequest};

/// Longest continuous file before the recording rotates into a new one.
pub const MAX_RECORDING_DURATION: Duration = Duration::from_secs(3 * 60 * 60);

#[derive(Debug, Clone)]
pub struct RecorderSettings {
  pub output_dir: PathBuf,
  pub max_duration: Duration,
  /// Geometry and rate handed to frame-writer sinks
  pub frame_width: u32,
  pub frame_height: u32,
  pub fps: u32,
}

impl Default for RecorderSettings {
  fn default() -> Self {
    Self {
      output_dir: PathBuf::from("./recordings"),
      max_duration: MAX_RECORDING_DURATION,
      frame_width: 640,
      frame_height: 360,
      fps: 15,
    }
  }
}

/// Per-camera recording state. `sink` is `Some` exactly while recording.
struct RecordingEntry {
  source_url: String,
  sink: Option<Box<dyn RecordingSink>>,
  started_at: Option<Instant>,
  current_file: Option<PathBuf>,
  frame_count: u64,
}

impl RecordingEntry {
  fn idle(source_url: String) -> Self {
    Self {
      source_url,
      sink: None,
      started_at: None,
      current_file: None,
      frame_count: 0,
    }
  }

  fn is_recording(&self) -> bool {
    self.sink.is_some()
  }
}

/// A finished recording file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSummary {
  pub camera: String,
  pub file: PathBuf,
  pub duration: Duration,
  pub frame_count: u64,
  pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordingStatus {
  pub camera: String,
  pub recording: bool,
  pub file: Option<String>,
  pub elapsed_secs: Option<u64>,
  pub frame_count: u64,
}

#[derive(Debug)]
pub enum ToggleOutcome {
  Started(PathBuf),
  Stopped(Option<RecordingSummary>),
}

/// What `on_frame` did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
  /// Camera is not recording
  Ignored,
  Written,
  /// Written, then the file hit the duration cap and a new one was started
  Rotated,
}

pub struct RecordingController {
  entries: RwLock<HashMap<String, Arc<Mutex<RecordingEntry>>>>,
  sinks: Arc<dyn SinkFactory>,
  settings: RecorderSettings,
}

impl RecordingController {
  pub fn new(sinks: Arc<dyn SinkFactory>, settings: RecorderSettings) -> Self {
    Self {
      entries: RwLock::new(HashMap::new()),
      sinks,
      settings,
    }
  }

  pub fn settings(&self) -> &RecorderSettings {
    &self.settings
  }

  /// Create the idle entry for a camera. Re-registering keeps any running
  /// recording and only updates the source URL.
  pub async fn register(&self, identity: &str, source_url: String) {
    let mut entries = self.entries.write().await;
    match entries.get(identity) {
      Some(existing) => existing.lock().await.source_url = source_url,
      None => {
        entries.insert(
          identity.to_string(),
          Arc::new(Mutex::new(RecordingEntry::idle(source_url))),
        );
      }
    }
  }

  /// Drop every entry, force-terminating active recordings. Returns how many
  /// recordings were cut short.
  pub async fn reset_all(&self) -> usize {
    let drained: Vec<_> = self.entries.write().await.drain().collect();
    let mut aborted = 0;
    for (identity, entry) in drained {
      let mut entry = entry.lock().await;
      if entry.is_recording() {
        aborted += 1;
      }
      abort_entry(&identity, &mut entry).await;
    }
    if aborted > 0 {
      warn!(aborted, "recordings force-terminated");
    }
    aborted
  }

  pub async fn is_recording(&self, identity: &str) -> bool {
    match self.entry(identity).await {
      Ok(entry) => entry.lock().await.is_recording(),
      Err(_) => false,
    }
  }

  pub async fn toggle(&self, identity: &str) -> Result<ToggleOutcome, CameraError> {
    let entry = self.entry(identity).await?;
    let mut entry = entry.lock().await;
    if entry.is_recording() {
      Ok(ToggleOutcome::Stopped(self.stop_locked(identity, &mut entry).await))
    } else {
      Ok(ToggleOutcome::Started(self.start_locked(identity, &mut entry).await?))
    }
  }

  /// Start recording. Returns the new file, or `None` when the camera was
  /// already recording (nothing changes in that case).
  pub async fn start(&self, identity: &str) -> Result<Option<PathBuf>, CameraError> {
    let entry = self.entry(identity).await?;
    let mut entry = entry.lock().await;
    if entry.is_recording() {
      debug!(camera = %identity, "already recording");
      return Ok(None);
    }
    self.start_locked(identity, &mut entry).await.map(Some)
  }

  /// Stop recording. `None` when the camera was idle.
  pub async fn stop(&self, identity: &str) -> Result<Option<RecordingSummary>, CameraError> {
    let entry = self.entry(identity).await?;
    let mut entry = entry.lock().await;
    Ok(self.stop_locked(identity, &mut entry).await)
  }

  /// Feed one frame from the camera's stream.
  ///
  /// A failed write finalizes the file and leaves the camera idle. Frames for
  /// unknown cameras are ignored.
  pub async fn on_frame(&self, identity: &str, frame: &Frame) -> Result<FrameOutcome, CameraError> {
    let Ok(entry) = self.entry(identity).await else {
      return Ok(FrameOutcome::Ignored);
    };
    let mut entry = entry.lock().await;

    let Some(sink) = entry.sink.as_mut() else {
      return Ok(FrameOutcome::Ignored);
    };

    if let Err(e) = sink.write_frame(frame).await {
      error!(camera = %identity, error = %e, "recording write failed, stopping");
      self.stop_locked(identity, &mut entry).await;
      return Err(CameraError::RecordingWrite(format!("{e:#}")));
    }
    entry.frame_count += 1;

    let expired = entry
      .started_at
      .is_some_and(|t| t.elapsed() >= self.settings.max_duration);
    if !expired {
      return Ok(FrameOutcome::Written);
    }

    info!(camera = %identity, max_secs = self.settings.max_duration.as_secs(), "rotating recording");
    self.stop_locked(identity, &mut entry).await;
    self.start_locked(identity, &mut entry).await?;
    Ok(FrameOutcome::Rotated)
  }

  pub async fn status(&self, identity: &str) -> Result<RecordingStatus, CameraError> {
    let entry = self.entry(identity).await?;
    let entry = entry.lock().await;
    Ok(status_of(identity, &entry))
  }

  pub async fn list(&self) -> Vec<RecordingStatus> {
    let entries: Vec<_> = self
      .entries
      .read()
      .await
      .iter()
      .map(|(id, e)| (id.clone(), Arc::clone(e)))
      .collect();

    let mut out = Vec::with_capacity(entries.len());
    for (identity, entry) in entries {
      out.push(status_of(&identity, &*entry.lock().await));
    }
    out.sort_by(|a, b| a.camera.cmp(&b.camera));
    out
  }

  async fn entry(&self, identity: &str) -> Result<Arc<Mutex<RecordingEntry>>, CameraError> {
    self
      .entries
      .read()
      .await
      .get(identity)
      .cloned()
      .ok_or_else(|| CameraError::not_found(identity))
  }

  async fn start_locked(
    &self,
    identity: &str,
    entry: &mut RecordingEntry,
  ) -> Result<PathBuf, CameraError> {
    let output_path = self
      .next_output_path(identity)
      .await
      .map_err(|e| CameraError::RecordingStart(format!("{e:#}")))?;

    let req = SinkRequest {
      camera: identity.to_string(),
      source_url: entry.source_url.clone(),
      output_path: output_path.clone(),
      width: self.settings.frame_width,
      height: self.settings.frame_height,
      fps: self.settings.fps,
    };

    let sink = self.sinks.open(&req).await.map_err(|e| {
      error!(camera = %identity, path = %output_path.display(), error = %e, "failed to start recording");
      CameraError::RecordingStart(format!("{e:#}"))
    })?;

    entry.sink = Some(sink);
    entry.started_at = Some(Instant::now());
    entry.current_file = Some(output_path.clone());
    entry.frame_count = 0;

    info!(camera = %identity, path = %output_path.display(), "recording started");
    Ok(output_path)
  }

  async fn stop_locked(&self, identity: &str, entry: &mut RecordingEntry) -> Option<RecordingSummary> {
    let sink = entry.sink.take()?;
    let duration = entry.started_at.take().map(|t| t.elapsed()).unwrap_or_default();
    let file = entry.current_file.take().unwrap_or_default();

    let size_bytes = match sink.finish().await {
      Ok(size) => size,
      Err(e) => {
        warn!(camera = %identity, error = %e, "recording did not finalize cleanly");
        0
      }
    };

    let summary = RecordingSummary {
      camera: identity.to_string(),
      file,
      duration,
      frame_count: entry.frame_count,
      size_bytes,
    };

    info!(
      camera = %identity,
      path = %summary.file.display(),
      duration_secs = summary.duration.as_secs(),
      frames = summary.frame_count,
      size_mb = format!("{:.2}", summary.size_bytes as f64 / (1024.0 * 1024.0)),
      "recording stopped"
    );
    Some(summary)
  }

  /// `{identity}_{YYYYMMDD_HHMMSS}.{ext}`, with `_N` appended while the name
  /// is taken.
  async fn next_output_path(&self, identity: &str) -> anyhow::Result<PathBuf> {
    let dir = &self.settings.output_dir;
    fs::create_dir_all(dir).await?;

    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let ext = self.sinks.extension();
    let mut candidate = dir.join(format!("{identity}_{stamp}.{ext}"));
    let mut n = 1;
    while fs::try_exists(&candidate).await? {
      candidate = dir.join(format!("{identity}_{stamp}_{n}.{ext}"));
      n += 1;
    }
    Ok(candidate)
  }
}

async fn abort_entry(identity: &str, entry: &mut RecordingEntry) {
  if let Some(sink) = entry.sink.take() {
    warn!(camera = %identity, "aborting active recording");
    sink.abort().await;
  }
  entry.started_at = None;
  entry.current_file = None;
}

fn status_of(identity: &str, entry: &RecordingEntry) -> RecordingStatus {
  RecordingStatus {
    camera: identity.to_string(),
    recording: entry.is_recording(),
    file: entry.current_file.as_ref().map(|p| p.display().to_string()),
    elapsed_secs: entry.started_at.map(|t| t.elapsed().as_secs()),
    frame_count: entry.frame_count,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::recording::sink::MemorySinkFactory;
  use tempfile::TempDir;

  const CAM: &str = "10.0.0.1";

  fn frame(seq: u64) -> Frame {
    Frame::new(2, 2, seq, vec![7u8; 12])
  }

  async fn controller(dir: &TempDir, sinks: MemorySinkFactory) -> RecordingController {
    let settings = RecorderSettings {
      output_dir: dir.path().to_path_buf(),
      ..RecorderSettings::default()
    };
    let ctl = RecordingController::new(Arc::new(sinks), settings);
    ctl.register(CAM, "rtsp://10.0.0.1/live".into()).await;
    ctl
  }

  #[tokio::test]
  async fn start_names_file_after_camera_and_time() {
    let dir = TempDir::new().unwrap();
    let ctl = controller(&dir, MemorySinkFactory::new()).await;

    let path = ctl.start(CAM).await.unwrap().unwrap();
    let name = path.file_name().unwrap().to_string_lossy().to_string();

    assert!(name.starts_with("10.0.0.1_"));
    assert!(name.ends_with(".mp4"));
    // 10.0.0.1_YYYYMMDD_HHMMSS.mp4
    assert_eq!(name.len(), "10.0.0.1_".len() + 15 + ".mp4".len());
    assert!(ctl.is_recording(CAM).await);
  }

  #[tokio::test]
  async fn start_while_recording_is_noop() {
    let dir = TempDir::new().unwrap();
    let sinks = MemorySinkFactory::new();
    let ctl = controller(&dir, sinks.clone()).await;

    let first = ctl.start(CAM).await.unwrap();
    ctl.on_frame(CAM, &frame(1)).await.unwrap();
    let second = ctl.start(CAM).await.unwrap();

    assert!(first.is_some());
    assert!(second.is_none());
    assert_eq!(sinks.opened().len(), 1);
    assert_eq!(ctl.status(CAM).await.unwrap().frame_count, 1);
  }

  #[tokio::test]
  async fn stop_while_idle_is_noop() {
    let dir = TempDir::new().unwrap();
    let sinks = MemorySinkFactory::new();
    let ctl = controller(&dir, sinks.clone()).await;

    assert!(ctl.stop(CAM).await.unwrap().is_none());
    assert!(sinks.finished().is_empty());
    assert!(!ctl.status(CAM).await.unwrap().recording);
  }

  #[tokio::test]
  async fn unknown_camera_is_not_found() {
    let dir = TempDir::new().unwrap();
    let ctl = controller(&dir, MemorySinkFactory::new()).await;

    assert!(matches!(ctl.start("10.9.9.9").await, Err(CameraError::CameraNotFound(_))));
    assert!(matches!(ctl.toggle("10.9.9.9").await, Err(CameraError::CameraNotFound(_))));
    assert_eq!(ctl.on_frame("10.9.9.9", &frame(1)).await.unwrap(), FrameOutcome::Ignored);
  }

  #[tokio::test]
  async fn toggle_alternates_and_summarizes() {
    let dir = TempDir::new().unwrap();
    let ctl = controller(&dir, MemorySinkFactory::new()).await;

    let started = match ctl.toggle(CAM).await.unwrap() {
      ToggleOutcome::Started(path) => path,
      other => panic!("expected start, got {other:?}"),
    };
    for seq in 1..=3 {
      assert_eq!(ctl.on_frame(CAM, &frame(seq)).await.unwrap(), FrameOutcome::Written);
    }

    match ctl.toggle(CAM).await.unwrap() {
      ToggleOutcome::Stopped(Some(summary)) => {
        assert_eq!(summary.file, started);
        assert_eq!(summary.frame_count, 3);
        assert_eq!(summary.size_bytes, 36);
      }
      other => panic!("expected stop, got {other:?}"),
    }
    assert!(!ctl.is_recording(CAM).await);
  }

  #[tokio::test]
  async fn failed_open_leaves_camera_idle() {
    let dir = TempDir::new().unwrap();
    let sinks = MemorySinkFactory::new().failing_opens(1);
    let ctl = controller(&dir, sinks.clone()).await;

    assert!(matches!(ctl.start(CAM).await, Err(CameraError::RecordingStart(_))));
    let status = ctl.status(CAM).await.unwrap();
    assert!(!status.recording);
    assert!(status.file.is_none());

    // the next attempt goes through
    assert!(ctl.start(CAM).await.unwrap().is_some());
  }

  #[tokio::test]
  async fn write_failure_finalizes_and_goes_idle() {
    let dir = TempDir::new().unwrap();
    let sinks = MemorySinkFactory::new().failing_writes_after(2);
    let ctl = controller(&dir, sinks.clone()).await;

    ctl.start(CAM).await.unwrap();
    ctl.on_frame(CAM, &frame(1)).await.unwrap();
    ctl.on_frame(CAM, &frame(2)).await.unwrap();
    let err = ctl.on_frame(CAM, &frame(3)).await.unwrap_err();

    assert!(matches!(err, CameraError::RecordingWrite(_)));
    assert!(!ctl.is_recording(CAM).await);
    assert_eq!(sinks.finished().len(), 1);
    assert_eq!(ctl.on_frame(CAM, &frame(4)).await.unwrap(), FrameOutcome::Ignored);
  }

  #[tokio::test(start_paused = true)]
  async fn reaching_max_duration_rotates_once() {
    let dir = TempDir::new().unwrap();
    let sinks = MemorySinkFactory::new();
    let ctl = controller(&dir, sinks.clone()).await;

    let first = ctl.start(CAM).await.unwrap().unwrap();
    ctl.on_frame(CAM, &frame(1)).await.unwrap();

    tokio::time::advance(MAX_RECORDING_DURATION).await;
    assert_eq!(ctl.on_frame(CAM, &frame(2)).await.unwrap(), FrameOutcome::Rotated);

    for seq in 3..10 {
      assert_eq!(ctl.on_frame(CAM, &frame(seq)).await.unwrap(), FrameOutcome::Written);
    }

    assert_eq!(sinks.opened().len(), 2);
    assert_eq!(sinks.finished(), vec![first.clone()]);

    let status = ctl.status(CAM).await.unwrap();
    assert!(status.recording);
    assert_ne!(status.file, Some(first.display().to_string()));
    assert_eq!(status.frame_count, 7);
  }

  #[tokio::test]
  async fn same_second_restart_gets_suffix() {
    let dir = TempDir::new().unwrap();
    let ctl = controller(&dir, MemorySinkFactory::new()).await;

    let a = ctl.start(CAM).await.unwrap().unwrap();
    ctl.stop(CAM).await.unwrap();
    let b = ctl.start(CAM).await.unwrap().unwrap();

    assert_ne!(a, b);
  }

  #[tokio::test]
  async fn reset_all_aborts_and_forgets() {
    let dir = TempDir::new().unwrap();
    let sinks = MemorySinkFactory::new();
    let ctl = controller(&dir, sinks.clone()).await;
    ctl.register("10.0.0.2", "rtsp://10.0.0.2/live".into()).await;

    ctl.start(CAM).await.unwrap();
    assert_eq!(ctl.reset_all().await, 1);

    assert_eq!(sinks.aborted().len(), 1);
    assert!(ctl.list().await.is_empty());
    assert!(matches!(ctl.stop(CAM).await, Err(CameraError::CameraNotFound(_))));
  }
}
