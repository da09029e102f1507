use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::config_store::ConfigError;
use common::CameraError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Nothing to serve yet, e.g. no frame received
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The camera answered badly or not at all
    #[error("bad gateway: {0}")]
    BadGateway(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::Unavailable(msg)
            | ApiError::BadGateway(msg)
            | ApiError::Internal(msg) => msg,
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

impl From<CameraError> for ApiError {
    fn from(err: CameraError) -> Self {
        let message = err.to_string();
        match err {
            CameraError::CameraNotFound(_) => ApiError::NotFound(message),
            CameraError::Validation(_) => ApiError::BadRequest(message),
            CameraError::PtzCommand(_) | CameraError::Connect(_) | CameraError::StreamRead(_) => {
                ApiError::BadGateway(message)
            }
            CameraError::RecordingStart(_)
            | CameraError::RecordingWrite(_)
            | CameraError::RetryExhausted(_) => ApiError::Internal(message),
        }
    }
}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Io { .. } => ApiError::Internal(err.to_string()),
            _ => ApiError::BadRequest(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::internal(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ValidationError;

    #[test]
    fn camera_errors_map_to_status_codes() {
        let cases = [
            (CameraError::not_found("10.0.0.9"), StatusCode::NOT_FOUND),
            (ValidationError::new("speed", "too fast").into(), StatusCode::BAD_REQUEST),
            (CameraError::PtzCommand("soap fault".into()), StatusCode::BAD_GATEWAY),
            (CameraError::RecordingStart("disk full".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
    }

    #[test]
    fn config_errors_are_client_errors_unless_io() {
        assert_eq!(ApiError::from(ConfigError::NotAList).status(), StatusCode::BAD_REQUEST);

        let io = ConfigError::Io {
            path: "camera_config.json".into(),
            source: std::io::Error::other("read-only"),
        };
        assert_eq!(ApiError::from(io).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
