//! File-backed camera configuration.
//!
//! The store is a JSON array of camera mappings (see [`CameraProfile::parse`]).
//! A missing file means "no cameras configured yet". When the file yields no
//! cameras, the legacy `CAMERA{N}_*` environment variables are consulted.

use serde_json::Value;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

use crate::error::ValidationError;
use crate::profile::{CameraProfile, Mapping};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access camera config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("camera config is not valid JSON: {0}")]
    Format(#[from] serde_json::Error),

    #[error("camera config must be a list of camera objects")]
    NotAList,

    #[error("camera #{index}: {source}")]
    Invalid {
        index: usize,
        #[source]
        source: ValidationError,
    },
}

#[derive(Clone, Debug)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every stored profile, in file order.
    ///
    /// One malformed entry fails the whole load; nothing is partially applied.
    pub async fn load(&self) -> Result<Vec<CameraProfile>, ConfigError> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no camera config yet");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }

        let entries = match serde_json::from_str::<Value>(&raw)? {
            Value::Array(entries) => entries,
            _ => return Err(ConfigError::NotAList),
        };

        let profiles = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| match entry {
                Value::Object(map) => {
                    CameraProfile::parse(map).map_err(|source| ConfigError::Invalid { index, source })
                }
                _ => Err(ConfigError::NotAList),
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(path = %self.path.display(), cameras = profiles.len(), "camera config loaded");
        Ok(profiles)
    }

    /// Validate and persist `profiles`, replacing the stored list.
    ///
    /// The file is written to a sibling temp file first and renamed into
    /// place, so a crash mid-write leaves the previous config intact.
    pub async fn save(&self, profiles: &[CameraProfile]) -> Result<(), ConfigError> {
        validate_all(profiles)?;

        let entries: Vec<Value> = profiles
            .iter()
            .map(|p| Value::Object(p.to_mapping()))
            .collect();
        let body = serde_json::to_string_pretty(&entries)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|source| self.io_error(source))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body).await.map_err(|source| self.io_error(source))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| self.io_error(source))?;

        info!(path = %self.path.display(), cameras = profiles.len(), "camera config saved");
        Ok(())
    }

    /// Load from the file, falling back to the legacy environment variables
    /// when the file holds no cameras.
    pub async fn load_or_env(&self) -> Result<Vec<CameraProfile>, ConfigError> {
        let profiles = self.load().await?;
        if !profiles.is_empty() {
            return Ok(profiles);
        }

        let from_env = profiles_from_env()?;
        if !from_env.is_empty() {
            info!(cameras = from_env.len(), "using cameras from CAMERA{{N}}_* environment");
        }
        Ok(from_env)
    }

    fn io_error(&self, source: std::io::Error) -> ConfigError {
        ConfigError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Parse a list of raw mappings (e.g. from the control API) into profiles and
/// check that they form a usable configuration.
pub fn parse_all(entries: &[Mapping]) -> Result<Vec<CameraProfile>, ConfigError> {
    let profiles = entries
        .iter()
        .enumerate()
        .map(|(index, raw)| {
            CameraProfile::parse(raw).map_err(|source| ConfigError::Invalid { index, source })
        })
        .collect::<Result<Vec<_>, _>>()?;
    validate_all(&profiles)?;
    Ok(profiles)
}

/// Every profile must be usable and identities must be unique.
pub fn validate_all(profiles: &[CameraProfile]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for (index, profile) in profiles.iter().enumerate() {
        profile
            .validate()
            .map_err(|source| ConfigError::Invalid { index, source })?;
        if !seen.insert(profile.identity()) {
            return Err(ConfigError::Invalid {
                index,
                source: ValidationError::new("ip", format!("duplicate camera {}", profile.ip)),
            });
        }
    }
    Ok(())
}

/// Legacy `CAMERA{N}_IP`, `CAMERA{N}_PORT`, `CAMERA{N}_USER`, `CAMERA{N}_PASS`
/// variables, numbered from 1 until the first missing `_IP`.
pub fn profiles_from_env() -> Result<Vec<CameraProfile>, ConfigError> {
    profiles_from_vars(|key| std::env::var(key).ok())
}

pub fn profiles_from_vars<F>(lookup: F) -> Result<Vec<CameraProfile>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut profiles = Vec::new();

    for n in 1.. {
        let Some(ip) = lookup(&format!("CAMERA{n}_IP")) else {
            break;
        };

        let mut raw = Mapping::new();
        raw.insert("ip".into(), Value::String(ip));
        if let Some(port) = lookup(&format!("CAMERA{n}_PORT")) {
            raw.insert("rtsp_port".into(), Value::String(port));
        }
        if let Some(user) = lookup(&format!("CAMERA{n}_USER")) {
            raw.insert("user".into(), Value::String(user));
        }
        if let Some(pass) = lookup(&format!("CAMERA{n}_PASS")) {
            raw.insert("password".into(), Value::String(pass));
        }

        let profile = CameraProfile::parse(&raw).map_err(|source| ConfigError::Invalid {
            index: profiles.len(),
            source,
        })?;
        profiles.push(profile);
    }

    Ok(profiles)
}
