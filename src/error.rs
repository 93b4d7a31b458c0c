//! Error taxonomy for the recognition pipeline
//!
//! Every backend failure is classified into an [`ErrorKind`] at the backend
//! boundary. The state machine only ever sees kinds, never adapter errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified failure kinds driving the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PermissionDenied,
    DeviceNotFound,
    DeviceBusy,
    NetworkError,
    Aborted,
    PermissionTimeout,
    Unknown,
}

impl ErrorKind {
    /// Terminal kinds are surfaced immediately and never retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ErrorKind::PermissionDenied | ErrorKind::DeviceNotFound)
    }

    pub fn is_permission(&self) -> bool {
        matches!(
            self,
            ErrorKind::PermissionDenied | ErrorKind::PermissionTimeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::DeviceNotFound => "device_not_found",
            ErrorKind::DeviceBusy => "device_busy",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::Aborted => "aborted",
            ErrorKind::PermissionTimeout => "permission_timeout",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by the public service API and by backend adapters.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum VoiceError {
    #[error("already listening")]
    AlreadyListening,

    #[error("voice service has been disposed")]
    ServiceClosed,

    /// A classified backend failure
    #[error("{kind}: {message}")]
    Backend { kind: ErrorKind, message: String },
}

impl VoiceError {
    pub fn backend(kind: ErrorKind, message: impl Into<String>) -> Self {
        VoiceError::Backend {
            kind,
            message: message.into(),
        }
    }

    /// Classification used when this error crosses the backend boundary.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VoiceError::Backend { kind, .. } => *kind,
            VoiceError::AlreadyListening => ErrorKind::DeviceBusy,
            VoiceError::ServiceClosed => ErrorKind::Aborted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_kinds() {
        assert!(ErrorKind::PermissionDenied.is_terminal());
        assert!(ErrorKind::DeviceNotFound.is_terminal());
        for kind in [
            ErrorKind::DeviceBusy,
            ErrorKind::NetworkError,
            ErrorKind::Aborted,
            ErrorKind::PermissionTimeout,
            ErrorKind::Unknown,
        ] {
            assert!(!kind.is_terminal(), "{kind} should be retryable");
        }
    }

    #[test]
    fn backend_error_display_includes_kind() {
        let err = VoiceError::backend(ErrorKind::NetworkError, "connection reset");
        assert_eq!(err.to_string(), "network_error: connection reset");
        assert_eq!(err.kind(), ErrorKind::NetworkError);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::PermissionTimeout).unwrap();
        assert_eq!(json, "\"permission_timeout\"");
    }
}
