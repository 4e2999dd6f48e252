//! Error types shared by every analyzer driver.
//!
//! The driver layer reports failures through three distinct channels:
//!
//! - **`CaptureError`**: the outcome of arming or running a capture. A capture
//!   that was armed successfully reports its final outcome through the
//!   completion channel instead (see [`crate::completion`]).
//! - **`ConnectError`**: why `connect` failed. Version negotiation failures carry
//!   the rejected [`DeviceVersion`] so callers can show what the device reported.
//! - **`DriverConstructionError`**: programmer errors caught when a driver is
//!   built (empty connection string, wrong number of ensemble members). These are
//!   the only failures raised before any I/O happens.
//!
//! Transport internals use `anyhow` freely; everything is translated into these
//! types at the driver boundary so raw I/O errors never escape the contract.

use crate::version::DeviceVersion;
use thiserror::Error;

// =============================================================================
// Capture Errors
// =============================================================================

/// Outcome of a capture request that did not succeed.
///
/// A successful request is the `Ok` arm of the surrounding `Result`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// A capture is already running on this driver.
    #[error("Device is busy with another capture")]
    Busy,

    /// The session settings are outside what the device supports.
    #[error("Invalid capture parameters: {0}")]
    BadParams(String),

    /// The driver is not connected, or the device reported a failure.
    #[error("Hardware error: {0}")]
    HardwareError(String),

    /// Anything else, typically a transport failure while arming.
    #[error("Unexpected error: {0}")]
    UnexpectedError(String),
}

impl CaptureError {
    /// Short label used in structured log fields.
    pub fn label(&self) -> &'static str {
        match self {
            CaptureError::Busy => "busy",
            CaptureError::BadParams(_) => "bad_params",
            CaptureError::HardwareError(_) => "hardware_error",
            CaptureError::UnexpectedError(_) => "unexpected_error",
        }
    }

    /// Translate a transport-level failure raised while arming.
    pub fn unexpected(err: impl std::fmt::Display) -> Self {
        CaptureError::UnexpectedError(err.to_string())
    }

    /// Error returned when a capture is requested on a disconnected driver.
    pub fn not_connected() -> Self {
        CaptureError::HardwareError("device is not connected".to_string())
    }
}

// =============================================================================
// Connection Errors
// =============================================================================

/// Reason a `connect` call failed.
///
/// After any of these the driver is left disconnected.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// Transport could not be opened or the device did not answer.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Device answered but with something the driver could not interpret.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Device firmware or API version is below the supported minimum.
    #[error("Unsupported device version '{}' (minimum supported is {minimum})", found.raw())]
    VersionMismatch {
        found: DeviceVersion,
        minimum: DeviceVersion,
    },

    /// The driver is already connected; disconnect first.
    #[error("Driver is already connected")]
    AlreadyConnected,

    /// Standard I/O failure on the transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectError {
    /// Wrap an `anyhow` chain, keeping every context line in the message.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        ConnectError::Connection(format!("{:#}", err))
    }
}

// =============================================================================
// Construction Errors
// =============================================================================

/// Errors raised synchronously while building a driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverConstructionError {
    /// The connection string was empty or whitespace.
    #[error("Connection string cannot be empty")]
    EmptyConnectionString,

    /// The connection string does not have the shape this driver expects.
    #[error("Malformed connection string '{input}': {reason}")]
    MalformedConnectionString { input: String, reason: String },

    /// A multi-device ensemble was requested with an unsupported member count.
    #[error("Multi-device capture needs between {min} and {max} devices, got {count}")]
    DeviceCount { count: usize, min: usize, max: usize },
}

impl DriverConstructionError {
    pub fn malformed(input: impl Into<String>, reason: impl Into<String>) -> Self {
        DriverConstructionError::MalformedConnectionString {
            input: input.into(),
            reason: reason.into(),
        }
    }
}

/// Reject empty or whitespace-only connection strings.
pub fn require_connection_string(input: &str) -> Result<&str, DriverConstructionError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DriverConstructionError::EmptyConnectionString);
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::VersionValidator;

    #[test]
    fn test_capture_error_display() {
        let err = CaptureError::BadParams("frequency too high".into());
        assert_eq!(
            err.to_string(),
            "Invalid capture parameters: frequency too high"
        );
        assert_eq!(CaptureError::Busy.label(), "busy");
    }

    #[test]
    fn test_version_mismatch_display() {
        let err = ConnectError::VersionMismatch {
            found: VersionValidator::parse(Some("V1_7")),
            minimum: VersionValidator::minimum_supported(),
        };
        let msg = err.to_string();
        assert!(msg.contains("V1_7"));
        assert!(msg.contains("6.5"));
    }

    #[test]
    fn test_require_connection_string() {
        assert_eq!(
            require_connection_string("  "),
            Err(DriverConstructionError::EmptyConnectionString)
        );
        assert_eq!(require_connection_string(" /dev/ttyACM0 "), Ok("/dev/ttyACM0"));
    }
}
