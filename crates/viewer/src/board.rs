//! Latest-frame board: the headless stand-in for a grid of video panes.

use anyhow::{Context, Result};
use common::Frame;
use image::{ImageFormat, RgbImage};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::stream::{EventConsumer, SessionState};

#[derive(Debug, Clone, Default)]
struct Tile {
    latest: Option<Frame>,
    last_error: Option<String>,
    state: Option<SessionState>,
    frames_seen: u64,
}

/// What the board shows for one camera.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TileView {
    pub camera: String,
    pub state: Option<String>,
    pub frames_seen: u64,
    pub has_frame: bool,
    pub last_error: Option<String>,
}

/// Keeps the most recent frame and error of every camera.
#[derive(Default)]
pub struct FrameBoard {
    tiles: Mutex<HashMap<String, Tile>>,
}

impl FrameBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self, camera: &str) -> Option<Frame> {
        self.tiles().get(camera).and_then(|t| t.latest.clone())
    }

    pub fn view(&self, camera: &str) -> Option<TileView> {
        self.tiles().get(camera).map(|t| view_of(camera, t))
    }

    pub fn views(&self) -> Vec<TileView> {
        let tiles = self.tiles();
        let mut views: Vec<_> = tiles.iter().map(|(c, t)| view_of(c, t)).collect();
        views.sort_by(|a, b| a.camera.cmp(&b.camera));
        views
    }

    /// The camera's latest frame as JPEG, `None` before the first frame.
    pub fn snapshot_jpeg(&self, camera: &str) -> Result<Option<Vec<u8>>> {
        let Some(frame) = self.latest(camera) else {
            return Ok(None);
        };
        encode_jpeg(&frame).map(Some)
    }

    fn tiles(&self) -> MutexGuard<'_, HashMap<String, Tile>> {
        self.tiles.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn view_of(camera: &str, tile: &Tile) -> TileView {
    TileView {
        camera: camera.to_string(),
        state: tile.state.map(|s| s.to_string()),
        frames_seen: tile.frames_seen,
        has_frame: tile.latest.is_some(),
        last_error: tile.last_error.clone(),
    }
}

pub fn encode_jpeg(frame: &Frame) -> Result<Vec<u8>> {
    let image = RgbImage::from_raw(frame.width, frame.height, frame.data.to_vec())
        .context("frame buffer does not match its geometry")?;
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Jpeg)
        .context("jpeg encoding failed")?;
    Ok(out.into_inner())
}

impl EventConsumer for FrameBoard {
    fn on_frame(&self, camera: &str, frame: &Frame) {
        let mut tiles = self.tiles();
        let tile = tiles.entry(camera.to_string()).or_default();
        tile.latest = Some(frame.clone());
        tile.frames_seen += 1;
    }

    fn on_error(&self, camera: &str, message: &str) {
        warn!(camera = %camera, error = %message, "camera error");
        self.tiles()
            .entry(camera.to_string())
            .or_default()
            .last_error = Some(message.to_string());
    }

    fn on_state(&self, camera: &str, state: SessionState) {
        self.tiles().entry(camera.to_string()).or_default().state = Some(state);
    }

    fn on_detach(&self, camera: &str) {
        if self.tiles().remove(camera).is_some() {
            debug!(camera = %camera, "tile removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u64) -> Frame {
        Frame::new(4, 2, seq, vec![128u8; Frame::rgb24_len(4, 2)])
    }

    #[test]
    fn keeps_latest_frame_per_camera() {
        let board = FrameBoard::new();
        board.on_state("a", SessionState::Streaming);
        board.on_frame("a", &frame(1));
        board.on_frame("a", &frame(2));
        board.on_frame("b", &frame(7));
        board.on_error("b", "stream read failed: eof");

        assert_eq!(board.latest("a").unwrap().sequence, 2);
        let views = board.views();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].state.as_deref(), Some("streaming"));
        assert_eq!(views[0].frames_seen, 2);
        assert_eq!(views[1].last_error.as_deref(), Some("stream read failed: eof"));

        board.on_detach("a");
        assert!(board.view("a").is_none());
    }

    #[test]
    fn snapshot_encodes_jpeg() {
        let board = FrameBoard::new();
        assert!(board.snapshot_jpeg("a").unwrap().is_none());

        board.on_frame("a", &frame(1));
        let jpeg = board.snapshot_jpeg("a").unwrap().unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let broken = Frame::new(4, 2, 1, vec![0u8; 5]);
        assert!(encode_jpeg(&broken).is_err());
    }
}
