use anyhow::{Context, Result};
use common::RetryPolicy;
use recorder::{FfmpegSinkFactory, RecorderSettings, RecordingMode, MAX_RECORDING_DURATION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::ptz::DEFAULT_PTZ_SPEED;
use crate::stream::{FfmpegFrameSource, RegistrySettings, SessionSettings};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub camera_config_path: PathBuf,
    pub recordings_root: PathBuf,
    pub recording_mode: RecordingMode,
    pub recording_max: Duration,
    pub connect_max_retries: u32,
    pub connect_retry_delay: Duration,
    pub connect_timeout: Duration,
    pub reconnect_cooldown: Duration,
    pub read_timeout: Duration,
    pub max_reconnects: Option<u32>,
    pub auto_reconnect_after: Option<Duration>,
    pub setup_parallelism: Option<usize>,
    pub frame_width: u32,
    pub frame_height: u32,
    pub frame_rate: u32,
    pub ptz_speed: f32,
    pub ffmpeg_bin: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys take their defaults; a key that
    /// is set but malformed is an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind = var("CAMWALL_ADDR").unwrap_or_else(|| "127.0.0.1:8090".to_string());
        let bind_addr: SocketAddr = bind.parse().context("invalid CAMWALL_ADDR")?;

        let recording_mode = match var("RECORDING_MODE") {
            Some(raw) => raw.parse().context("invalid RECORDING_MODE")?,
            None => RecordingMode::default(),
        };

        let ptz_speed: f32 = parse_or(&var, "PTZ_SPEED", DEFAULT_PTZ_SPEED)?;
        if !(ptz_speed > 0.0 && ptz_speed <= 1.0) {
            anyhow::bail!("invalid PTZ_SPEED: must be in (0, 1], got {ptz_speed}");
        }

        Ok(Self {
            bind_addr,
            camera_config_path: var("CAMERA_CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("camera_config.json")),
            recordings_root: var("RECORDINGS_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./recordings")),
            recording_mode,
            recording_max: Duration::from_secs(positive_or(
                &var,
                "RECORDING_MAX_SECS",
                MAX_RECORDING_DURATION.as_secs(),
            )?),
            connect_max_retries: positive_or(&var, "CONNECT_MAX_RETRIES", 3)?,
            connect_retry_delay: Duration::from_millis(parse_or(&var, "CONNECT_RETRY_DELAY_MS", 2000)?),
            connect_timeout: Duration::from_millis(positive_or(&var, "CONNECT_TIMEOUT_MS", 10_000)?),
            reconnect_cooldown: Duration::from_millis(parse_or(&var, "RECONNECT_COOLDOWN_MS", 5000)?),
            read_timeout: Duration::from_millis(positive_or(&var, "READ_TIMEOUT_MS", 10_000)?),
            max_reconnects: parse_opt(&var, "MAX_RECONNECTS")?,
            auto_reconnect_after: parse_opt(&var, "AUTO_RECONNECT_SECS")?.map(Duration::from_secs),
            setup_parallelism: positive_opt(&var, "SETUP_PARALLELISM")?,
            frame_width: positive_or(&var, "FRAME_WIDTH", 640)?,
            frame_height: positive_or(&var, "FRAME_HEIGHT", 360)?,
            frame_rate: positive_or(&var, "FRAME_RATE", 15)?,
            ptz_speed,
            ffmpeg_bin: var("FFMPEG_BIN").unwrap_or_else(|| "ffmpeg".to_string()),
        })
    }

    pub fn connect_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.connect_max_retries, self.connect_retry_delay, self.connect_timeout)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            connect_retry: self.connect_retry(),
            onvif_retry: self.connect_retry(),
            reconnect_cooldown: self.reconnect_cooldown,
            read_timeout: self.read_timeout,
            max_reconnects: self.max_reconnects,
            ..SessionSettings::default()
        }
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            session: self.session_settings(),
            setup_parallelism: self.setup_parallelism,
            auto_reconnect_after: self.auto_reconnect_after,
            ptz_speed: self.ptz_speed,
        }
    }

    pub fn recorder_settings(&self) -> RecorderSettings {
        RecorderSettings {
            output_dir: self.recordings_root.clone(),
            max_duration: self.recording_max,
            frame_width: self.frame_width,
            frame_height: self.frame_height,
            fps: self.frame_rate,
        }
    }

    pub fn frame_source(&self) -> FfmpegFrameSource {
        FfmpegFrameSource::new(self.frame_width, self.frame_height).with_binary(&self.ffmpeg_bin)
    }

    pub fn sink_factory(&self) -> FfmpegSinkFactory {
        FfmpegSinkFactory::new(self.recording_mode).with_binary(&self.ffmpeg_bin)
    }
}

fn parse_or<T, V>(var: &V, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    V: Fn(&str) -> Option<String>,
{
    Ok(parse_opt(var, key)?.unwrap_or(default))
}

/// Like `parse_or`, but zero is rejected.
fn positive_or<T, V>(var: &V, key: &str, default: T) -> Result<T>
where
    T: FromStr + Default + PartialEq,
    T::Err: std::error::Error + Send + Sync + 'static,
    V: Fn(&str) -> Option<String>,
{
    Ok(positive_opt(var, key)?.unwrap_or(default))
}

fn positive_opt<T, V>(var: &V, key: &str) -> Result<Option<T>>
where
    T: FromStr + Default + PartialEq,
    T::Err: std::error::Error + Send + Sync + 'static,
    V: Fn(&str) -> Option<String>,
{
    match parse_opt::<T, V>(var, key)? {
        Some(value) if value == T::default() => anyhow::bail!("invalid {key}: must be greater than zero"),
        other => Ok(other),
    }
}

fn parse_opt<T, V>(var: &V, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    V: Fn(&str) -> Option<String>,
{
    var(key)
        .map(|raw| raw.trim().parse::<T>().with_context(|| format!("invalid {key}: {raw:?}")))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = config(&[]).unwrap();

        assert_eq!(cfg.bind_addr, "127.0.0.1:8090".parse().unwrap());
        assert_eq!(cfg.camera_config_path, PathBuf::from("camera_config.json"));
        assert_eq!(cfg.recording_mode, RecordingMode::Subprocess);
        assert_eq!(cfg.recording_max, Duration::from_secs(10_800));
        assert_eq!(cfg.max_reconnects, None);
        assert_eq!(cfg.auto_reconnect_after, None);

        let session = cfg.session_settings();
        assert_eq!(session.connect_retry.max_retries, 3);
        assert_eq!(session.connect_retry.delay, Duration::from_secs(2));
        assert_eq!(session.reconnect_cooldown, Duration::from_secs(5));
        assert_eq!(cfg.recorder_settings().fps, 15);
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = config(&[
            ("RECORDING_MODE", "writer"),
            ("MAX_RECONNECTS", "10"),
            ("AUTO_RECONNECT_SECS", "60"),
            ("SETUP_PARALLELISM", "2"),
            ("PTZ_SPEED", "0.5"),
            ("READ_TIMEOUT_MS", " 2500 "),
        ])
        .unwrap();

        assert_eq!(cfg.recording_mode, RecordingMode::FrameWriter);
        assert_eq!(cfg.max_reconnects, Some(10));
        assert_eq!(cfg.auto_reconnect_after, Some(Duration::from_secs(60)));
        let registry = cfg.registry_settings();
        assert_eq!(registry.setup_parallelism, Some(2));
        assert_eq!(registry.ptz_speed, 0.5);
        assert_eq!(registry.session.read_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = config(&[("CONNECT_MAX_RETRIES", "three")]).unwrap_err();
        assert!(err.to_string().contains("CONNECT_MAX_RETRIES"));

        assert!(config(&[("CAMWALL_ADDR", "nowhere")]).is_err());
        assert!(config(&[("RECORDING_MODE", "tape")]).is_err());
        assert!(config(&[("PTZ_SPEED", "4")]).is_err());
    }

    #[test]
    fn zero_sizes_and_durations_are_rejected() {
        for key in [
            "FRAME_WIDTH",
            "FRAME_HEIGHT",
            "FRAME_RATE",
            "RECORDING_MAX_SECS",
            "CONNECT_MAX_RETRIES",
            "CONNECT_TIMEOUT_MS",
            "READ_TIMEOUT_MS",
            "SETUP_PARALLELISM",
        ] {
            let err = config(&[(key, "0")]).unwrap_err();
            assert!(err.to_string().contains(key), "{key}: {err}");
        }

        // a zero cooldown or retry delay is fine
        let cfg = config(&[("RECONNECT_COOLDOWN_MS", "0"), ("CONNECT_RETRY_DELAY_MS", "0")]).unwrap();
        assert_eq!(cfg.reconnect_cooldown, Duration::ZERO);
        assert_eq!((cfg.frame_width, cfg.frame_height), (640, 360));
    }
}
