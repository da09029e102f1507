//! Camera connection parameters.
//!
//! A [`CameraProfile`] is built once from configuration and then shared
//! read-only with the session that serves it. Editing a camera produces a
//! new profile; nothing mutates a profile that a session already holds.

use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::validation;

pub const DEFAULT_RTSP_PORT: u16 = 554;
pub const DEFAULT_ONVIF_PORT: u16 = 80;

/// Stream path used when no explicit RTSP URL is configured.
const DEFAULT_STREAM_PATH: &str = "live/ch0";

/// Untyped key/value form of a profile as stored on disk.
pub type Mapping = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CameraProfile {
    pub ip: String,
    pub rtsp_port: u16,
    pub onvif_port: u16,
    pub user: String,
    pub password: String,
    /// Verbatim stream URL; never `Some("")`.
    pub rtsp_url_override: Option<String>,
}

impl Default for CameraProfile {
    fn default() -> Self {
        Self {
            ip: String::new(),
            rtsp_port: DEFAULT_RTSP_PORT,
            onvif_port: DEFAULT_ONVIF_PORT,
            user: String::new(),
            password: String::new(),
            rtsp_url_override: None,
        }
    }
}

impl CameraProfile {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_ports(mut self, rtsp_port: u16, onvif_port: u16) -> Self {
        self.rtsp_port = rtsp_port;
        self.onvif_port = onvif_port;
        self
    }

    pub fn with_rtsp_url(mut self, url: impl Into<String>) -> Self {
        self.rtsp_url_override = non_empty(url.into());
        self
    }

    /// Runtime identity of the camera. Assumed unique within one configuration.
    pub fn identity(&self) -> &str {
        &self.ip
    }

    /// Build a profile from its stored mapping.
    ///
    /// Missing optional keys take their defaults and unknown keys are ignored.
    /// A port that is present but not an integer in 1..=65535 is rejected.
    pub fn parse(raw: &Mapping) -> Result<Self, ValidationError> {
        Ok(Self {
            ip: read_string(raw, "ip")?,
            rtsp_port: read_port(raw, "rtsp_port", DEFAULT_RTSP_PORT)?,
            onvif_port: read_port(raw, "onvif_port", DEFAULT_ONVIF_PORT)?,
            user: read_string(raw, "user")?,
            password: read_string(raw, "password")?,
            rtsp_url_override: non_empty(read_string(raw, "rtsp_url")?),
        })
    }

    /// Stored form of the profile. Every field is emitted; an absent
    /// override is written as an empty `rtsp_url`.
    pub fn to_mapping(&self) -> Mapping {
        let mut map = Map::new();
        map.insert("ip".into(), Value::String(self.ip.clone()));
        map.insert("rtsp_port".into(), Value::from(self.rtsp_port));
        map.insert("onvif_port".into(), Value::from(self.onvif_port));
        map.insert("user".into(), Value::String(self.user.clone()));
        map.insert("password".into(), Value::String(self.password.clone()));
        map.insert(
            "rtsp_url".into(),
            Value::String(self.rtsp_url_override.clone().unwrap_or_default()),
        );
        map
    }

    /// URL the frame source is opened with.
    pub fn connection_url(&self) -> String {
        match &self.rtsp_url_override {
            Some(url) if !url.is_empty() => url.clone(),
            _ => format!(
                "rtsp://{}:{}@{}:{}/{}",
                self.user, self.password, self.ip, self.rtsp_port, DEFAULT_STREAM_PATH
            ),
        }
    }

    /// Connection URL with the password masked, for logs.
    ///
    /// Passwords may contain `/`, `?` or `@`, so for an override URL
    /// everything between the scheme and the last `@` is treated as userinfo.
    pub fn redacted_url(&self) -> String {
        if let Some(url) = self.rtsp_url_override.as_deref().filter(|u| !u.is_empty()) {
            return redact_userinfo(url);
        }
        format!(
            "rtsp://{}:***@{}:{}/{}",
            self.user, self.ip, self.rtsp_port, DEFAULT_STREAM_PATH
        )
    }

    /// Check that the profile can actually drive a session.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validation::validate_identity(&self.ip, "ip")?;
        validation::validate_port(self.rtsp_port, "rtsp_port")?;
        validation::validate_port(self.onvif_port, "onvif_port")?;
        validation::validate_length(&self.user, validation::MAX_CREDENTIAL_LENGTH, "user")?;
        validation::validate_length(&self.password, validation::MAX_CREDENTIAL_LENGTH, "password")?;
        if let Some(url) = &self.rtsp_url_override {
            validation::validate_uri(url, "rtsp_url")?;
        }
        Ok(())
    }
}

impl TryFrom<&Mapping> for CameraProfile {
    type Error = ValidationError;

    fn try_from(raw: &Mapping) -> Result<Self, Self::Error> {
        Self::parse(raw)
    }
}

fn redact_userinfo(url: &str) -> String {
    let Some(scheme_end) = url.find("://").map(|i| i + 3) else {
        return url.to_string();
    };
    match url[scheme_end..].rfind('@').map(|i| i + scheme_end) {
        Some(at) => {
            let user = url[scheme_end..at].split(':').next().unwrap_or_default();
            format!("{}{}:***{}", &url[..scheme_end], user, &url[at..])
        }
        None => url.to_string(),
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn read_string(raw: &Mapping, key: &str) -> Result<String, ValidationError> {
    match raw.get(key) {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Bool(b)) => Ok(b.to_string()),
        Some(other) => Err(ValidationError::new(key, format!("expected a string, got {}", other))),
    }
}

fn read_port(raw: &Mapping, key: &str, default: u16) -> Result<u16, ValidationError> {
    let port = match raw.get(key) {
        None | Some(Value::Null) => return Ok(default),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|v| u16::try_from(v).ok())
            .ok_or_else(|| ValidationError::new(key, format!("not a valid port: {}", n)))?,
        Some(Value::String(s)) => s
            .trim()
            .parse::<u16>()
            .map_err(|_| ValidationError::new(key, format!("not an integer port: {:?}", s)))?,
        Some(other) => {
            return Err(ValidationError::new(key, format!("expected an integer, got {}", other)));
        }
    };
    validation::validate_port(port, key)?;
    Ok(port)
}
