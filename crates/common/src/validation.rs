//! Input validation for camera configuration.
//!
//! Everything read from the configuration file, the legacy environment
//! variables or the control API passes through here before it reaches a
//! session. Identities end up in recording file names and URLs end up on
//! an ffmpeg command line, so both are checked for separators and control
//! characters.

use crate::error::ValidationError;

// ============================================================================
// CONSTANTS: Input Size Limits
// ============================================================================

/// Maximum length for camera identities (host names or IP addresses)
pub const MAX_IDENTITY_LENGTH: usize = 253;

/// Maximum length for stream URLs
pub const MAX_URI_LENGTH: usize = 4096;

/// Maximum length for user names and passwords
pub const MAX_CREDENTIAL_LENGTH: usize = 512;

// ============================================================================
// String Validation
// ============================================================================

/// Validate string length against a maximum
pub fn validate_length(value: &str, max_length: usize, field_name: &str) -> Result<(), ValidationError> {
    if value.len() > max_length {
        return Err(ValidationError::new(
            field_name,
            format!("exceeds maximum length of {} bytes (got {})", max_length, value.len()),
        ));
    }
    Ok(())
}

/// Validate non-empty string
pub fn validate_non_empty(value: &str, field_name: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new(field_name, "cannot be empty"));
    }
    Ok(())
}

/// Validate a camera identity.
///
/// The identity is the camera address and doubles as a file-name prefix for
/// recordings, so path separators and whitespace are refused.
pub fn validate_identity(identity: &str, field_name: &str) -> Result<(), ValidationError> {
    validate_non_empty(identity, field_name)?;
    validate_length(identity, MAX_IDENTITY_LENGTH, field_name)?;

    if identity.contains("..") || identity.contains('/') || identity.contains('\\') {
        return Err(ValidationError::new(
            field_name,
            "contains invalid characters (no path separators or '..' allowed)",
        ));
    }
    if identity.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ValidationError::new(field_name, "contains whitespace"));
    }

    Ok(())
}

/// Validate a stream URL such as `rtsp://host:554/path`
pub fn validate_uri(uri: &str, field_name: &str) -> Result<(), ValidationError> {
    validate_non_empty(uri, field_name)?;
    validate_length(uri, MAX_URI_LENGTH, field_name)?;

    if !uri.contains("://") {
        return Err(ValidationError::new(field_name, "missing scheme (expected e.g. rtsp://)"));
    }
    if uri.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ValidationError::new(field_name, "contains whitespace or control characters"));
    }

    Ok(())
}

// ============================================================================
// Numeric Validation
// ============================================================================

/// Validate port number (1-65535)
pub fn validate_port(port: u16, field_name: &str) -> Result<(), ValidationError> {
    if port == 0 {
        return Err(ValidationError::new(field_name, "port must be between 1 and 65535, got 0"));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
