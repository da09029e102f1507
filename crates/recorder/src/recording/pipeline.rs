use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use common::Frame;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};

use super::sink::{RecordingSink, SinkFactory, SinkRequest};

/// How long ffmpeg gets to write the MP4 trailer before it is killed.
const FINALIZE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a fresh ffmpeg must stay up before the recording counts as started.
const STARTUP_GRACE: Duration = Duration::from_millis(300);

/// Which encode path a recording takes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordingMode {
  /// ffmpeg opens the camera URL itself and re-encodes it
  #[default]
  Subprocess,
  /// Frames read by the session are piped into ffmpeg
  FrameWriter,
}

impl FromStr for RecordingMode {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self> {
    match s.trim().to_lowercase().as_str() {
      "subprocess" => Ok(Self::Subprocess),
      "writer" | "frame-writer" => Ok(Self::FrameWriter),
      other => Err(anyhow!("unknown recording mode {other:?} (expected subprocess or writer)")),
    }
  }
}

/// Spawns one ffmpeg process per recording file.
#[derive(Debug, Clone)]
pub struct FfmpegSinkFactory {
  mode: RecordingMode,
  binary: String,
  startup_grace: Duration,
}

impl FfmpegSinkFactory {
  pub fn new(mode: RecordingMode) -> Self {
    Self {
      mode,
      binary: "ffmpeg".to_string(),
      startup_grace: STARTUP_GRACE,
    }
  }

  pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
    self.binary = binary.into();
    self
  }

  pub fn with_startup_grace(mut self, grace: Duration) -> Self {
    self.startup_grace = grace;
    self
  }

  pub fn mode(&self) -> RecordingMode {
    self.mode
  }

  fn build_args(&self, req: &SinkRequest) -> Result<Vec<String>> {
    let output = path_arg(&req.output_path)?;
    Ok(match self.mode {
      RecordingMode::Subprocess => build_capture_args(&req.source_url, output),
      RecordingMode::FrameWriter => build_writer_args(req.width, req.height, req.fps, output),
    })
  }
}

fn path_arg(path: &Path) -> Result<&str> {
  path
    .to_str()
    .ok_or_else(|| anyhow!("output path is not valid UTF-8: {}", path.display()))
}

fn encode_args() -> Vec<String> {
  ["-c:v", "libx264", "-crf", "23", "-preset", "medium"]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn container_args(output: &str) -> Vec<String> {
  ["-f", "mp4", "-movflags", "faststart", "-y", output]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Arguments for re-encoding a camera stream straight from its URL.
pub fn build_capture_args(source_url: &str, output: &str) -> Vec<String> {
  let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-rtsp_transport", "tcp", "-i", source_url]
    .iter()
    .map(|s| s.to_string())
    .collect();
  args.extend(encode_args());
  args.extend(["-c:a", "aac", "-b:a", "128k"].iter().map(|s| s.to_string()));
  args.extend(container_args(output));
  args
}

/// Arguments for encoding raw RGB24 frames arriving on stdin.
pub fn build_writer_args(width: u32, height: u32, fps: u32, output: &str) -> Vec<String> {
  let mut args: Vec<String> = vec![
    "-hide_banner".into(),
    "-loglevel".into(),
    "error".into(),
    "-f".into(),
    "rawvideo".into(),
    "-pix_fmt".into(),
    "rgb24".into(),
    "-s".into(),
    format!("{width}x{height}"),
    "-r".into(),
    fps.max(1).to_string(),
    "-i".into(),
    "pipe:0".into(),
  ];
  args.extend(encode_args());
  args.extend(["-pix_fmt", "yuv420p"].iter().map(|s| s.to_string()));
  args.extend(container_args(output));
  args
}

#[async_trait]
impl SinkFactory for FfmpegSinkFactory {
  fn extension(&self) -> &str {
    "mp4"
  }

  async fn open(&self, req: &SinkRequest) -> Result<Box<dyn RecordingSink>> {
    let args = self.build_args(req)?;
    debug!(camera = %req.camera, mode = ?self.mode, args = ?args, "launching ffmpeg");

    let mut child = Command::new(&self.binary)
      .args(&args)
      .stdin(Stdio::piped())
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .kill_on_drop(true)
      .spawn()
      .with_context(|| format!("failed to spawn {}", self.binary))?;

    // `wait` would close stdin, so take it first
    let stdin = child.stdin.take();

    // bad arguments or an unwritable output make ffmpeg quit within the grace period
    match tokio::time::timeout(self.startup_grace, child.wait()).await {
      Ok(Ok(status)) => bail!("ffmpeg exited at startup with {status}"),
      Ok(Err(e)) => bail!("failed to poll ffmpeg: {e}"),
      Err(_) => {}
    }

    info!(
      camera = %req.camera,
      mode = ?self.mode,
      path = %req.output_path.display(),
      pid = ?child.id(),
      "ffmpeg recording started"
    );

    Ok(Box::new(FfmpegProcessSink {
      camera: req.camera.clone(),
      mode: self.mode,
      child,
      stdin,
      output_path: req.output_path.clone(),
      width: req.width,
      height: req.height,
    }))
  }
}

/// A running ffmpeg process producing one file.
pub struct FfmpegProcessSink {
  camera: String,
  mode: RecordingMode,
  child: Child,
  stdin: Option<ChildStdin>,
  output_path: PathBuf,
  width: u32,
  height: u32,
}

impl FfmpegProcessSink {
  async fn wait_or_kill(&mut self) -> Result<()> {
    match tokio::time::timeout(FINALIZE_TIMEOUT, self.child.wait()).await {
      Ok(Ok(status)) if status.success() => Ok(()),
      Ok(Ok(status)) => {
        warn!(camera = %self.camera, %status, "ffmpeg exited with error");
        Ok(())
      }
      Ok(Err(e)) => Err(anyhow!("failed to wait for ffmpeg: {e}")),
      Err(_) => {
        warn!(camera = %self.camera, "ffmpeg did not finalize in time, forcing kill");
        self.child.kill().await.context("failed to kill ffmpeg")?;
        Ok(())
      }
    }
  }
}

#[async_trait]
impl RecordingSink for FfmpegProcessSink {
  async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
    match self.mode {
      RecordingMode::Subprocess => {
        // the process pulls the stream itself; only check that it is alive
        if let Some(status) = self.child.try_wait().context("failed to poll ffmpeg")? {
          bail!("ffmpeg exited with {status}");
        }
        Ok(())
      }
      RecordingMode::FrameWriter => {
        if frame.width != self.width || frame.height != self.height {
          bail!(
            "frame is {}x{}, recording was opened at {}x{}",
            frame.width,
            frame.height,
            self.width,
            self.height
          );
        }
        let stdin = self
          .stdin
          .as_mut()
          .ok_or_else(|| anyhow!("ffmpeg stdin already closed"))?;
        stdin
          .write_all(&frame.data)
          .await
          .context("failed to pipe frame to ffmpeg")
      }
    }
  }

  async fn finish(mut self: Box<Self>) -> Result<u64> {
    if let Some(mut stdin) = self.stdin.take() {
      if self.mode == RecordingMode::Subprocess {
        // `q` asks ffmpeg to stop and write the trailer
        if let Err(e) = stdin.write_all(b"q").await {
          debug!(camera = %self.camera, error = %e, "ffmpeg stdin already gone");
        }
      }
      // closing stdin ends the raw input in writer mode
      drop(stdin);
    }

    self.wait_or_kill().await?;

    let size = fs::metadata(&self.output_path)
      .await
      .map(|m| m.len())
      .unwrap_or(0);
    Ok(size)
  }

  async fn abort(mut self: Box<Self>) {
    self.stdin.take();
    if let Err(e) = self.child.kill().await {
      warn!(camera = %self.camera, error = %e, "failed to kill ffmpeg");
    }
  }
}
