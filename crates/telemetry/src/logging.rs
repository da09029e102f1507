use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Log output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format (default for interactive use)
    #[default]
    Pretty,
    /// Compact single-line text
    Compact,
    /// JSON lines for log shippers
    Json,
}

impl LogFormat {
    /// Unknown names fall back to the default.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "json" => Self::Json,
            "compact" => Self::Compact,
            "pretty" => Self::Pretty,
            _ => Self::default(),
        }
    }

    /// Read `LOG_FORMAT`.
    pub fn from_env() -> Self {
        Self::parse(&env::var("LOG_FORMAT").unwrap_or_default())
    }
}

/// Configuration for structured logging
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Reported in the startup line, e.g. "camwall"
    pub service_name: String,
    pub service_version: String,
    /// Emit span open/close events (session lifecycles show up this way)
    pub enable_span_events: bool,
    /// Also write JSON logs to a daily-rotated file under `log_dir`
    pub log_to_file: bool,
    pub log_dir: Option<String>,
}

impl LogConfig {
    /// Defaults from `LOG_FORMAT`, `LOG_SPAN_EVENTS`, `LOG_TO_FILE` and `LOG_DIR`.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            format: LogFormat::from_env(),
            service_name: service_name.into(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            enable_span_events: env_flag("LOG_SPAN_EVENTS"),
            log_to_file: env_flag("LOG_TO_FILE"),
            log_dir: env::var("LOG_DIR").ok(),
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = version.into();
        self
    }

    pub fn with_span_events(mut self, enable: bool) -> Self {
        self.enable_span_events = enable;
        self
    }

    pub fn with_file_logging(mut self, log_dir: impl Into<String>) -> Self {
        self.log_to_file = true;
        self.log_dir = Some(log_dir.into());
        self
    }

    fn span_events(&self) -> FmtSpan {
        if self.enable_span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    /// File name used by the rolling appender.
    fn log_file_prefix(&self) -> String {
        format!("{}.log", self.service_name)
    }
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(false)
}

/// Install the global subscriber.
///
/// The returned guard flushes the file appender; keep it alive for the
/// lifetime of the process. It is `None` when file logging is off.
pub fn init_structured_logging(config: LogConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive("hyper=warn".parse().context("hyper directive")?)
        .add_directive("reqwest=warn".parse().context("reqwest directive")?);

    let span_events = config.span_events();

    let stdout_layer = match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_thread_names(true)
            .with_writer(io::stdout)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_target(true)
            .with_thread_ids(false)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_target(true)
            .with_thread_ids(false)
            .with_line_number(true)
            .boxed(),
    };

    let (file_layer, guard) = match (&config.log_to_file, &config.log_dir) {
        (true, Some(log_dir)) => {
            let appender = tracing_appender::rolling::daily(log_dir, config.log_file_prefix());
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_span_events(config.span_events())
                .with_writer(non_blocking)
                .boxed();
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .context("global tracing subscriber already installed")?;

    tracing::info!(
        service.name = %config.service_name,
        service.version = %config.service_version,
        format = ?config.format,
        log_to_file = guard.is_some(),
        "structured logging initialized"
    );

    Ok(guard)
}

/// Initialize logging with defaults for `service_name`
pub fn init_with_service(service_name: impl Into<String>) -> Result<Option<WorkerGuard>> {
    init_structured_logging(LogConfig::new(service_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse(" Compact "), LogFormat::Compact);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("xml"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse(""), LogFormat::Pretty);
    }

    #[test]
    fn test_log_config_builder() {
        let config = LogConfig::new("camwall")
            .with_version("1.2.3")
            .with_format(LogFormat::Json)
            .with_span_events(true)
            .with_file_logging("/tmp/camwall-logs");

        assert_eq!(config.service_name, "camwall");
        assert_eq!(config.service_version, "1.2.3");
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.enable_span_events);
        assert!(config.log_to_file);
        assert_eq!(config.log_dir.as_deref(), Some("/tmp/camwall-logs"));
        assert_eq!(config.log_file_prefix(), "camwall.log");
    }

    #[test]
    fn test_span_events_follow_flag() {
        let off = LogConfig::new("camwall").with_span_events(false);
        assert_eq!(off.span_events(), FmtSpan::NONE);

        let on = LogConfig::new("camwall").with_span_events(true);
        assert_eq!(on.span_events(), FmtSpan::NEW | FmtSpan::CLOSE);
    }
}
