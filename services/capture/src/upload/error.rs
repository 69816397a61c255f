use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Code reported by transports when a transfer was cancelled through its control.
pub const TRANSFER_CANCELLED_CODE: &str = "transfer_cancelled";

/// Failure reported by a [`StorageTransport`](super::StorageTransport).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct TransportError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl TransportError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable,
        }
    }

    pub fn retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, message, true)
    }

    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, message, false)
    }

    pub fn cancelled() -> Self {
        Self::fatal(TRANSFER_CANCELLED_CODE, "transfer cancelled")
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == TRANSFER_CANCELLED_CODE
    }
}

/// Why an upload attempt ended without success.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadFailure {
    #[error("photo has zero bytes")]
    ZeroBytes,

    #[error("no bytes sent within {0:?}")]
    NoProgress(Duration),

    #[error("no progress for {0:?}")]
    Stalled(Duration),

    #[error("transfer stayed paused for {0:?}")]
    Paused(Duration),

    #[error("attempt exceeded {0:?}")]
    Timeout(Duration),

    #[error("device went offline")]
    Offline,

    #[error("upload cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(TransportError),
}

impl UploadFailure {
    /// Stable machine-readable code.
    pub fn code(&self) -> &str {
        match self {
            UploadFailure::ZeroBytes => "upload_zero_bytes",
            UploadFailure::NoProgress(_) => "no_progress",
            UploadFailure::Stalled(_) => "stalled",
            UploadFailure::Paused(_) => "paused",
            UploadFailure::Timeout(_) => "upload_timeout",
            UploadFailure::Offline => "upload_offline",
            UploadFailure::Cancelled => "upload_cancelled",
            UploadFailure::Transport(e) => &e.code,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            UploadFailure::ZeroBytes | UploadFailure::Cancelled => false,
            UploadFailure::NoProgress(_)
            | UploadFailure::Stalled(_)
            | UploadFailure::Paused(_)
            | UploadFailure::Timeout(_)
            | UploadFailure::Offline => true,
            UploadFailure::Transport(e) => e.retryable,
        }
    }
}

impl From<TransportError> for UploadFailure {
    fn from(err: TransportError) -> Self {
        if err.is_cancelled() {
            UploadFailure::Cancelled
        } else {
            UploadFailure::Transport(err)
        }
    }
}

/// Final error of an upload, with the progress of the last attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadError {
    pub failure: UploadFailure,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub was_offline: bool,
    /// Attempts made, including the failing one
    pub attempts: u32,
}

impl UploadError {
    pub fn code(&self) -> &str {
        self.failure.code()
    }

    pub fn is_retryable(&self) -> bool {
        self.failure.is_retryable()
    }
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "upload failed ({}) after {}/{} bytes: {}",
            self.code(),
            self.bytes_transferred,
            self.total_bytes,
            self.failure
        )
    }
}

impl std::error::Error for UploadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(!UploadFailure::ZeroBytes.is_retryable());
        assert!(!UploadFailure::Cancelled.is_retryable());
        assert!(UploadFailure::Offline.is_retryable());
        assert!(UploadFailure::Stalled(Duration::from_secs(15)).is_retryable());
        assert!(UploadFailure::Transport(TransportError::retryable("http_503", "busy")).is_retryable());
        assert!(!UploadFailure::Transport(TransportError::fatal("http_403", "denied")).is_retryable());
    }

    #[test]
    fn test_codes() {
        assert_eq!(UploadFailure::ZeroBytes.code(), "upload_zero_bytes");
        assert_eq!(UploadFailure::Timeout(Duration::from_secs(90)).code(), "upload_timeout");
        assert_eq!(
            UploadFailure::Transport(TransportError::fatal("http_403", "denied")).code(),
            "http_403"
        );
    }

    #[test]
    fn test_cancelled_transport_error_maps_to_cancelled() {
        let failure: UploadFailure = TransportError::cancelled().into();
        assert_eq!(failure, UploadFailure::Cancelled);
    }

    #[test]
    fn test_display_includes_progress() {
        let err = UploadError {
            failure: UploadFailure::Offline,
            bytes_transferred: 10,
            total_bytes: 100,
            was_offline: true,
            attempts: 1,
        };
        assert_eq!(
            err.to_string(),
            "upload failed (upload_offline) after 10/100 bytes: device went offline"
        );
    }
}
