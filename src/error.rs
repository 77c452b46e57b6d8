//! Error types for telemetry ingestion.
//!
//! Every fallible operation in the crate returns [`TelemetryError`]. Errors are
//! tagged with an [`ErrorKind`] so the connection supervisor can decide, without
//! string matching, whether to retry, to stop, or to drop a single frame.
//!
//! ## Error Categories
//!
//! - **Transient**: discovery misses, link-layer failures and timeouts. Retried
//!   after a fixed backoff.
//! - **Fatal**: anything not classified as a link issue, including session log
//!   I/O failures. The supervisor stops.
//! - **Per-frame**: malformed frames. Logged and discarded, streaming continues.
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use drumlink::TelemetryError;
//!
//! let error = TelemetryError::connection_failed("link layer dropped");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for telemetry operations.
pub type Result<T, E = TelemetryError> = std::result::Result<T, E>;

/// How the supervisor treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retried after a fixed backoff.
    Transient,
    /// Stops the supervisor.
    Fatal,
    /// Drops one frame; the stream continues.
    PerFrame,
}

/// Failure to turn one raw frame into a sample.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Bad packet length: expected {expected} {unit}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize, unit: &'static str },

    #[error("Cannot unpack field '{field}': {reason}")]
    FieldUnpack { field: String, reason: String },
}

/// Main error type for telemetry operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TelemetryError {
    #[error("Device '{target}' not found within {timeout:?}")]
    DeviceNotFound { target: String, timeout: Duration },

    #[error("Connection error: {reason}")]
    Connection {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    #[error("Unexpected error: {reason}")]
    Unexpected {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Session log error: {}", path.display())]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("I/O error")]
    Io(#[source] std::io::Error),
}

impl TelemetryError {
    /// Classify this error for the supervisor's retry policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TelemetryError::DeviceNotFound { .. } => ErrorKind::Transient,
            TelemetryError::Connection { .. } => ErrorKind::Transient,
            TelemetryError::Timeout { .. } => ErrorKind::Transient,
            TelemetryError::Decode(_) => ErrorKind::PerFrame,
            TelemetryError::Unexpected { .. } => ErrorKind::Fatal,
            TelemetryError::Log { .. } => ErrorKind::Fatal,
            TelemetryError::Config { .. } => ErrorKind::Fatal,
            TelemetryError::Io(_) => ErrorKind::Fatal,
        }
    }

    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            TelemetryError::DeviceNotFound { .. } => vec![
                "Ensure the peripheral is powered and advertising",
                "Check the configured device name or address",
                "Move the receiver closer to the drum",
            ],
            TelemetryError::Connection { .. } => vec![
                "Check the Bluetooth adapter or serial cable",
                "Power-cycle the peripheral",
                "Verify no other program holds the link",
            ],
            TelemetryError::Timeout { .. } => vec![
                "Increase the configured timeout",
                "Check radio interference near the rig",
            ],
            TelemetryError::Unexpected { .. } => vec![
                "Check the characteristic UUID matches the firmware",
                "Restart the pipeline after inspecting the log",
            ],
            TelemetryError::Decode(_) => vec![
                "Check the configured packet layout matches the firmware build",
                "Verify the framing (binary or text) for this link",
            ],
            TelemetryError::Log { .. } => vec![
                "Check free disk space on the log volume",
                "Check write permissions for the session directory",
            ],
            TelemetryError::Config { .. } => vec![
                "Fix the reported configuration field",
                "Compare against the documented defaults",
            ],
            TelemetryError::Io(_) => vec!["Check file permissions", "Check the path exists"],
        }
    }

    /// Helper constructor for discovery misses.
    pub fn device_not_found(target: impl Into<String>, timeout: Duration) -> Self {
        TelemetryError::DeviceNotFound { target: target.into(), timeout }
    }

    /// Helper constructor for link-layer failures.
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        TelemetryError::Connection { reason: reason.into(), source: None }
    }

    /// Helper constructor for link-layer failures with source.
    pub fn connection_failed_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        TelemetryError::Connection { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for timeouts.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        TelemetryError::Timeout { operation: operation.into(), duration }
    }

    /// Helper constructor for errors that stop the supervisor.
    pub fn unexpected(reason: impl Into<String>) -> Self {
        TelemetryError::Unexpected { reason: reason.into(), source: None }
    }

    /// Helper constructor for fatal errors with source.
    pub fn unexpected_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        TelemetryError::Unexpected { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for session log failures with path context.
    pub fn log_error(path: PathBuf, source: std::io::Error) -> Self {
        TelemetryError::Log { path, source }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        TelemetryError::Config { reason: reason.into() }
    }
}

impl From<std::io::Error> for TelemetryError {
    fn from(err: std::io::Error) -> Self {
        TelemetryError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn error_messages_carry_their_context(
                reason in "[a-zA-Z0-9 ]{1,40}",
                target in "[A-Za-z0-9:_-]{1,20}",
                expected in 1usize..64,
                actual in 0usize..64,
            ) {
                let conn = TelemetryError::connection_failed(reason.clone());
                prop_assert!(conn.to_string().contains(&reason));

                let missing = TelemetryError::device_not_found(target.clone(), Duration::from_secs(8));
                prop_assert!(missing.to_string().contains(&target));

                let decode: TelemetryError =
                    DecodeError::LengthMismatch { expected, actual, unit: "bytes" }.into();
                let msg = decode.to_string();
                prop_assert!(msg.contains(&expected.to_string()));
                prop_assert!(msg.contains(&actual.to_string()));
            }

            #[test]
            fn source_chain_is_preserved(base in "[a-z]{1,20}") {
                let err = TelemetryError::connection_failed_with_source(
                    "adapter",
                    Box::new(std::io::Error::other(base.clone())),
                );
                let source = std::error::Error::source(&err).map(|s| s.to_string());
                prop_assert_eq!(source, Some(base));
            }
        }
    }

    #[test]
    fn classification_matches_retry_policy() {
        assert_eq!(
            TelemetryError::device_not_found("rig", Duration::from_secs(8)).kind(),
            ErrorKind::Transient
        );
        assert!(TelemetryError::connection_failed("drop").is_retryable());
        assert!(TelemetryError::timeout("connect", Duration::from_secs(10)).is_retryable());
        assert!(!TelemetryError::unexpected("gatt").is_retryable());
        assert!(
            !TelemetryError::log_error(PathBuf::from("/x"), std::io::Error::other("full"))
                .is_retryable()
        );

        let decode: TelemetryError =
            DecodeError::LengthMismatch { expected: 20, actual: 19, unit: "bytes" }.into();
        assert_eq!(decode.kind(), ErrorKind::PerFrame);
    }

    #[test]
    fn suggestions_are_present_for_every_kind() {
        let errors = [
            TelemetryError::device_not_found("rig", Duration::from_secs(8)),
            TelemetryError::connection_failed("drop"),
            TelemetryError::unexpected("gatt"),
            TelemetryError::config("capacity"),
        ];
        for error in &errors {
            let suggestions = error.recovery_suggestions();
            assert!(!suggestions.is_empty());
            assert!(suggestions.iter().all(|s| s.len() > 5));
        }
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<TelemetryError>();
        assert_send_sync_static::<DecodeError>();
    }
}
