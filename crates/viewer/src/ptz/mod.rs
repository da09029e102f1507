//! Pan/tilt control of a camera.
//!
//! A [`PtzConnector`] performs the per-camera setup (service discovery and
//! media profile lookup) and hands back a [`PtzChannel`] that the session owns
//! for the rest of its life.

pub mod onvif;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use common::CameraProfile;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

pub use onvif::{OnvifPtzChannel, OnvifPtzConnector};

/// Default continuous-move speed in ONVIF generic velocity units.
pub const DEFAULT_PTZ_SPEED: f32 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PtzDirection {
    Up,
    Down,
    Left,
    Right,
}

impl PtzDirection {
    /// Velocity vector for a continuous move at `speed`.
    pub fn velocity(self, speed: f32) -> PanTilt {
        match self {
            PtzDirection::Up => PanTilt { x: 0.0, y: speed },
            PtzDirection::Down => PanTilt { x: 0.0, y: -speed },
            PtzDirection::Left => PanTilt { x: -speed, y: 0.0 },
            PtzDirection::Right => PanTilt { x: speed, y: 0.0 },
        }
    }
}

impl FromStr for PtzDirection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            "left" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            other => Err(anyhow!("unknown direction {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PanTilt {
    pub x: f32,
    pub y: f32,
}

#[async_trait]
pub trait PtzConnector: Send + Sync {
    async fn setup(&self, profile: &CameraProfile) -> Result<Box<dyn PtzChannel>>;
}

/// Control channel bound to one camera and one media profile.
#[async_trait]
pub trait PtzChannel: Send + Sync {
    fn profile_token(&self) -> &str;

    async fn continuous_move(&self, velocity: PanTilt) -> Result<()>;

    /// Stop pan, tilt and zoom.
    async fn stop(&self) -> Result<()>;
}

// ============================================================================
// Mock connector for tests
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum PtzCommand {
    Move { camera: String, velocity: PanTilt },
    Stop { camera: String },
}

#[derive(Debug, Default)]
struct MockPtzLog {
    setups: u32,
    failing_setups: u32,
    failing_commands: bool,
    commands: Vec<PtzCommand>,
}

/// Connector whose channels record the commands they receive.
#[derive(Clone, Default)]
pub struct MockPtzConnector {
    log: Arc<Mutex<MockPtzLog>>,
}

impl MockPtzConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` setups fail.
    pub fn failing_setups(self, n: u32) -> Self {
        self.log().failing_setups = n;
        self
    }

    /// Every setup fails.
    pub fn unavailable(self) -> Self {
        self.failing_setups(u32::MAX)
    }

    /// Channels set up fine but every command errors.
    pub fn failing_commands(self) -> Self {
        self.log().failing_commands = true;
        self
    }

    pub fn setup_calls(&self) -> u32 {
        self.log().setups
    }

    pub fn commands(&self) -> Vec<PtzCommand> {
        self.log().commands.clone()
    }

    fn log(&self) -> MutexGuard<'_, MockPtzLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl PtzConnector for MockPtzConnector {
    async fn setup(&self, profile: &CameraProfile) -> Result<Box<dyn PtzChannel>> {
        let mut log = self.log();
        log.setups += 1;
        if log.failing_setups > 0 {
            log.failing_setups -= 1;
            bail!("mock: no ONVIF service at {}", profile.ip);
        }
        debug!(camera = %profile.ip, "mock: ptz ready");
        Ok(Box::new(MockPtzChannel {
            camera: profile.identity().to_string(),
            log: Arc::clone(&self.log),
        }))
    }
}

struct MockPtzChannel {
    camera: String,
    log: Arc<Mutex<MockPtzLog>>,
}

impl MockPtzChannel {
    fn record(&self, command: PtzCommand) -> Result<()> {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        if log.failing_commands {
            bail!("mock: camera rejected command");
        }
        log.commands.push(command);
        Ok(())
    }
}

#[async_trait]
impl PtzChannel for MockPtzChannel {
    fn profile_token(&self) -> &str {
        "mock_profile"
    }

    async fn continuous_move(&self, velocity: PanTilt) -> Result<()> {
        self.record(PtzCommand::Move {
            camera: self.camera.clone(),
            velocity,
        })
    }

    async fn stop(&self) -> Result<()> {
        self.record(PtzCommand::Stop {
            camera: self.camera.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn velocity_follows_direction() {
        assert_eq!(PtzDirection::Up.velocity(0.1), PanTilt { x: 0.0, y: 0.1 });
        assert_eq!(PtzDirection::Down.velocity(0.1), PanTilt { x: 0.0, y: -0.1 });
        assert_eq!(PtzDirection::Left.velocity(0.5), PanTilt { x: -0.5, y: 0.0 });
        assert_eq!(PtzDirection::Right.velocity(0.5), PanTilt { x: 0.5, y: 0.0 });
    }

    #[test]
    fn direction_parses_case_insensitively() {
        assert_eq!("LEFT".parse::<PtzDirection>().unwrap(), PtzDirection::Left);
        assert!("forward".parse::<PtzDirection>().is_err());

        let parsed: PtzDirection = serde_json::from_str("\"up\"").unwrap();
        assert_eq!(parsed, PtzDirection::Up);
    }

    #[tokio::test]
    async fn mock_records_commands_per_camera() {
        let connector = MockPtzConnector::new().failing_setups(1);
        let profile = CameraProfile::new("10.0.0.9");

        assert!(connector.setup(&profile).await.is_err());
        let channel = connector.setup(&profile).await.unwrap();
        channel.continuous_move(PtzDirection::Right.velocity(0.1)).await.unwrap();
        channel.stop().await.unwrap();

        assert_eq!(connector.setup_calls(), 2);
        assert_eq!(
            connector.commands(),
            vec![
                PtzCommand::Move {
                    camera: "10.0.0.9".into(),
                    velocity: PanTilt { x: 0.1, y: 0.0 }
                },
                PtzCommand::Stop {
                    camera: "10.0.0.9".into()
                },
            ]
        );
    }
}
