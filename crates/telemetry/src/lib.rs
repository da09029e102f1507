//! Logging setup and request tracing shared by the camwall binaries.

pub mod logging;
pub mod request_id;

pub use logging::{init_structured_logging, init_with_service, LogConfig, LogFormat};
pub use request_id::{RequestId, RequestIdLayer, X_REQUEST_ID};
