pub mod config_store;
pub mod error;
pub mod frame;
pub mod profile;
pub mod retry;
pub mod validation;

pub use error::{CameraError, ValidationError};
pub use frame::Frame;
pub use profile::CameraProfile;
pub use retry::{RetryExhausted, RetryPolicy};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
