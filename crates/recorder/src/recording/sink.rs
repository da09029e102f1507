use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use common::Frame;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Everything a sink needs to start writing one file.
#[derive(Debug, Clone)]
pub struct SinkRequest {
  pub camera: String,
  /// Camera stream URL, used by sinks that pull the stream themselves
  pub source_url: String,
  pub output_path: PathBuf,
  pub width: u32,
  pub height: u32,
  pub fps: u32,
}

/// An open recording destination.
///
/// Exactly one of `finish` or `abort` consumes the sink; dropping it without
/// either must still release the underlying resources.
#[async_trait]
pub trait RecordingSink: Send {
  async fn write_frame(&mut self, frame: &Frame) -> Result<()>;

  /// Finalize the file and return its size in bytes.
  async fn finish(self: Box<Self>) -> Result<u64>;

  /// Tear down without waiting for a clean finalize.
  async fn abort(self: Box<Self>);
}

#[async_trait]
pub trait SinkFactory: Send + Sync {
  /// File extension of produced recordings, without the dot.
  fn extension(&self) -> &str;

  async fn open(&self, req: &SinkRequest) -> Result<Box<dyn RecordingSink>>;
}

// ============================================================================
// In-memory sink for tests
// ============================================================================

#[derive(Debug, Default)]
struct SinkLog {
  opened: Vec<PathBuf>,
  finished: Vec<PathBuf>,
  aborted: Vec<PathBuf>,
  frames_written: u64,
  failing_opens: u32,
  fail_writes_after: Option<u64>,
}

/// Sink factory that keeps frames in memory and records what happened.
///
/// `open` creates an empty placeholder at the output path so the path counts
/// as taken, like a real encoder would.
#[derive(Clone, Default)]
pub struct MemorySinkFactory {
  log: Arc<Mutex<SinkLog>>,
}

impl MemorySinkFactory {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make the next `n` opens fail.
  pub fn failing_opens(self, n: u32) -> Self {
    self.log().failing_opens = n;
    self
  }

  /// Every sink refuses writes once it holds `frames` frames.
  pub fn failing_writes_after(self, frames: u64) -> Self {
    self.log().fail_writes_after = Some(frames);
    self
  }

  pub fn opened(&self) -> Vec<PathBuf> {
    self.log().opened.clone()
  }

  pub fn finished(&self) -> Vec<PathBuf> {
    self.log().finished.clone()
  }

  pub fn aborted(&self) -> Vec<PathBuf> {
    self.log().aborted.clone()
  }

  pub fn frames_written(&self) -> u64 {
    self.log().frames_written
  }

  fn log(&self) -> MutexGuard<'_, SinkLog> {
    self.log.lock().unwrap_or_else(|e| e.into_inner())
  }
}

#[async_trait]
impl SinkFactory for MemorySinkFactory {
  fn extension(&self) -> &str {
    "mp4"
  }

  async fn open(&self, req: &SinkRequest) -> Result<Box<dyn RecordingSink>> {
    let fail_writes_after = {
      let mut log = self.log();
      if log.failing_opens > 0 {
        log.failing_opens -= 1;
        bail!("memory sink refused to open {}", req.output_path.display());
      }
      log.opened.push(req.output_path.clone());
      log.fail_writes_after
    };

    tokio::fs::File::create(&req.output_path)
      .await
      .with_context(|| format!("failed to create {}", req.output_path.display()))?;

    debug!(camera = %req.camera, path = %req.output_path.display(), "memory sink opened");
    Ok(Box::new(MemorySink {
      path: req.output_path.clone(),
      log: Arc::clone(&self.log),
      frames: 0,
      bytes: 0,
      fail_writes_after,
    }))
  }
}

struct MemorySink {
  path: PathBuf,
  log: Arc<Mutex<SinkLog>>,
  frames: u64,
  bytes: u64,
  fail_writes_after: Option<u64>,
}

impl MemorySink {
  fn log(&self) -> MutexGuard<'_, SinkLog> {
    self.log.lock().unwrap_or_else(|e| e.into_inner())
  }
}

#[async_trait]
impl RecordingSink for MemorySink {
  async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
    if self.fail_writes_after.is_some_and(|limit| self.frames >= limit) {
      bail!("memory sink is full");
    }
    self.frames += 1;
    self.bytes += frame.data.len() as u64;
    self.log().frames_written += 1;
    Ok(())
  }

  async fn finish(self: Box<Self>) -> Result<u64> {
    self.log().finished.push(self.path.clone());
    Ok(self.bytes)
  }

  async fn abort(self: Box<Self>) {
    self.log().aborted.push(self.path.clone());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn request(dir: &TempDir, name: &str) -> SinkRequest {
    SinkRequest {
      camera: "10.0.0.1".into(),
      source_url: "rtsp://10.0.0.1/live".into(),
      output_path: dir.path().join(name),
      width: 2,
      height: 2,
      fps: 15,
    }
  }

  #[tokio::test]
  async fn memory_sink_tracks_lifecycle() {
    let dir = TempDir::new().unwrap();
    let factory = MemorySinkFactory::new();

    let mut sink = factory.open(&request(&dir, "a.mp4")).await.unwrap();
    assert!(dir.path().join("a.mp4").exists());

    sink.write_frame(&Frame::new(2, 2, 1, vec![0u8; 12])).await.unwrap();
    sink.write_frame(&Frame::new(2, 2, 2, vec![0u8; 12])).await.unwrap();
    assert_eq!(sink.finish().await.unwrap(), 24);

    assert_eq!(factory.opened(), vec![dir.path().join("a.mp4")]);
    assert_eq!(factory.finished(), vec![dir.path().join("a.mp4")]);
    assert_eq!(factory.frames_written(), 2);
  }

  #[tokio::test]
  async fn memory_sink_failure_modes() {
    let dir = TempDir::new().unwrap();
    let factory = MemorySinkFactory::new().failing_opens(1).failing_writes_after(1);

    assert!(factory.open(&request(&dir, "a.mp4")).await.is_err());
    assert!(!dir.path().join("a.mp4").exists());

    let mut sink = factory.open(&request(&dir, "b.mp4")).await.unwrap();
    sink.write_frame(&Frame::new(2, 2, 1, vec![0u8; 12])).await.unwrap();
    assert!(sink.write_frame(&Frame::new(2, 2, 2, vec![0u8; 12])).await.is_err());
    sink.abort().await;

    assert_eq!(factory.aborted(), vec![dir.path().join("b.mp4")]);
  }
}
