use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use common::Frame;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

/// Opens decoded video streams.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Open `url`. Succeeds only once the stream has produced a frame.
    async fn open(&self, url: &str) -> Result<Box<dyn FrameStream>>;
}

/// An open stream, exclusively owned by one session.
///
/// Dropping a stream without calling `release` must not leak the native
/// resource.
#[async_trait]
pub trait FrameStream: Send {
    /// Next frame; end of stream is an error.
    async fn read(&mut self) -> Result<Frame>;

    async fn release(&mut self);
}

// ============================================================================
// ffmpeg-backed source
// ============================================================================

/// Decodes a stream to RGB24 with an ffmpeg child process.
#[derive(Debug, Clone)]
pub struct FfmpegFrameSource {
    binary: String,
    width: u32,
    height: u32,
}

impl FfmpegFrameSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            binary: "ffmpeg".to_string(),
            width,
            height,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn build_args(&self, url: &str) -> Vec<String> {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
        if url.starts_with("rtsp://") {
            args.push("-rtsp_transport".into());
            args.push("tcp".into());
        }
        args.extend([
            "-i".to_string(),
            url.to_string(),
            "-an".to_string(),
            "-vf".to_string(),
            format!("scale={}:{}", self.width, self.height),
            "-pix_fmt".to_string(),
            "rgb24".to_string(),
            "-f".to_string(),
            "rawvideo".to_string(),
            "pipe:1".to_string(),
        ]);
        args
    }
}

#[async_trait]
impl FrameSource for FfmpegFrameSource {
    async fn open(&self, url: &str) -> Result<Box<dyn FrameStream>> {
        let mut child = Command::new(&self.binary)
            .args(self.build_args(url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.binary))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdout not captured"))?;

        let mut stream = FfmpegFrameStream {
            child,
            stdout,
            width: self.width,
            height: self.height,
            sequence: 0,
            pending: None,
        };

        // the stream only counts as open once a whole frame came through
        let first = stream.read_frame().await.context("stream produced no frames")?;
        stream.pending = Some(first);
        debug!(pid = ?stream.child.id(), "frame source opened");

        Ok(Box::new(stream))
    }
}

struct FfmpegFrameStream {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
    sequence: u64,
    pending: Option<Frame>,
}

impl FfmpegFrameStream {
    async fn read_frame(&mut self) -> Result<Frame> {
        let mut buf = vec![0u8; Frame::rgb24_len(self.width, self.height)];
        match self.stdout.read_exact(&mut buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => bail!("end of stream"),
            Err(e) => return Err(e).context("failed to read frame from ffmpeg"),
        }
        self.sequence += 1;
        Ok(Frame::new(self.width, self.height, self.sequence, buf))
    }
}

#[async_trait]
impl FrameStream for FfmpegFrameStream {
    async fn read(&mut self) -> Result<Frame> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        self.read_frame().await
    }

    async fn release(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "ffmpeg already exited");
        }
        if tokio::time::timeout(Duration::from_secs(2), self.child.wait())
            .await
            .is_err()
        {
            warn!(pid = ?self.child.id(), "ffmpeg did not exit after kill");
        }
    }
}

// ============================================================================
// Scripted source for tests
// ============================================================================

/// Behaviour of one stream handed out by [`MockFrameSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPlan {
    /// Frames forever
    Endless,
    /// `n` frames, then a read error
    FailAfter(u64),
    /// Every read blocks forever
    Hang,
}

#[derive(Debug)]
struct MockScript {
    failing_opens: u32,
    hanging_opens: bool,
    plans: VecDeque<StreamPlan>,
    frame_interval: Duration,
    width: u32,
    height: u32,
    open_calls: u32,
    read_calls: u64,
    released: u32,
}

/// Frame source driven by a script, with counters for assertions.
#[derive(Clone)]
pub struct MockFrameSource {
    script: Arc<Mutex<MockScript>>,
}

impl Default for MockFrameSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFrameSource {
    /// Endless 4x2 streams at one frame per 10ms.
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(MockScript {
                failing_opens: 0,
                hanging_opens: false,
                plans: VecDeque::new(),
                frame_interval: Duration::from_millis(10),
                width: 4,
                height: 2,
                open_calls: 0,
                read_calls: 0,
                released: 0,
            })),
        }
    }

    /// The next `n` opens fail.
    pub fn failing_opens(self, n: u32) -> Self {
        self.fail_next_opens(n);
        self
    }

    /// Like [`failing_opens`](Self::failing_opens), for a source already in use.
    pub fn fail_next_opens(&self, n: u32) {
        self.script().failing_opens = n;
    }

    /// Every open fails.
    pub fn unreachable(self) -> Self {
        self.failing_opens(u32::MAX)
    }

    /// Every open blocks until abandoned.
    pub fn hanging_opens(self) -> Self {
        self.script().hanging_opens = true;
        self
    }

    /// Queue the plan for the next opened stream. Streams without a queued
    /// plan are endless.
    pub fn then_stream(self, plan: StreamPlan) -> Self {
        self.script().plans.push_back(plan);
        self
    }

    pub fn open_calls(&self) -> u32 {
        self.script().open_calls
    }

    pub fn read_calls(&self) -> u64 {
        self.script().read_calls
    }

    pub fn released(&self) -> u32 {
        self.script().released
    }

    fn script(&self) -> MutexGuard<'_, MockScript> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl FrameSource for MockFrameSource {
    async fn open(&self, url: &str) -> Result<Box<dyn FrameStream>> {
        let (hang, plan, interval, width, height) = {
            let mut script = self.script();
            script.open_calls += 1;
            if script.failing_opens > 0 {
                script.failing_opens -= 1;
                bail!("mock: connection refused by {url}");
            }
            (
                script.hanging_opens,
                script.plans.pop_front().unwrap_or(StreamPlan::Endless),
                script.frame_interval,
                script.width,
                script.height,
            )
        };

        if hang {
            std::future::pending::<()>().await;
        }

        Ok(Box::new(MockFrameStream {
            script: Arc::clone(&self.script),
            plan,
            interval,
            width,
            height,
            produced: 0,
        }))
    }
}

struct MockFrameStream {
    script: Arc<Mutex<MockScript>>,
    plan: StreamPlan,
    interval: Duration,
    width: u32,
    height: u32,
    produced: u64,
}

#[async_trait]
impl FrameStream for MockFrameStream {
    async fn read(&mut self) -> Result<Frame> {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .read_calls += 1;

        match self.plan {
            StreamPlan::Hang => {
                std::future::pending::<()>().await;
            }
            StreamPlan::FailAfter(n) if self.produced >= n => bail!("mock: stream dropped"),
            _ => {}
        }

        tokio::time::sleep(self.interval).await;
        self.produced += 1;
        Ok(Frame::new(
            self.width,
            self.height,
            self.produced,
            vec![0u8; Frame::rgb24_len(self.width, self.height)],
        ))
    }

    async fn release(&mut self) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .released += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ffmpeg_args_decode_to_raw_rgb() {
        let source = FfmpegFrameSource::new(640, 360);

        let rtsp = source.build_args("rtsp://u:p@10.0.0.1:554/live/ch0").join(" ");
        assert!(rtsp.contains("-rtsp_transport tcp -i rtsp://u:p@10.0.0.1:554/live/ch0"));
        assert!(rtsp.ends_with("-an -vf scale=640:360 -pix_fmt rgb24 -f rawvideo pipe:1"));

        let file = source.build_args("/videos/test.mp4").join(" ");
        assert!(!file.contains("-rtsp_transport"));
    }

    #[tokio::test]
    async fn missing_ffmpeg_fails_open() {
        let source = FfmpegFrameSource::new(4, 2).with_binary("/nonexistent/camwall-ffmpeg");
        assert!(source.open("rtsp://10.0.0.1/live").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn mock_follows_script() {
        let source = MockFrameSource::new()
            .failing_opens(1)
            .then_stream(StreamPlan::FailAfter(2));

        assert!(source.open("rtsp://a").await.is_err());

        let mut stream = source.open("rtsp://a").await.unwrap();
        assert_eq!(stream.read().await.unwrap().sequence, 1);
        assert_eq!(stream.read().await.unwrap().sequence, 2);
        assert!(stream.read().await.is_err());
        stream.release().await;

        let mut endless = source.open("rtsp://a").await.unwrap();
        for _ in 0..5 {
            assert!(endless.read().await.unwrap().is_complete());
        }

        assert_eq!(source.open_calls(), 3);
        assert_eq!(source.read_calls(), 8);
        assert_eq!(source.released(), 1);
    }
}
