//! Error types for the Pullman engine

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur in the Pullman engine
#[derive(Debug, Error)]
pub enum PullmanError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Transfer not found: {0}")]
    NotFound(Uuid),

    #[error("Torrent not found: {0}")]
    TorrentNotFound(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Malformed metadata: {0}")]
    Protocol(String),

    #[error("checksum-mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    #[error("Timeout")]
    Timeout,

    #[error("stall-timeout: no progress for {window_secs}s")]
    StallTimeout { window_secs: u32 },

    #[error("Disk full or quota exceeded: {0}")]
    DiskFull(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Transfer was cancelled")]
    Cancelled,

    #[error("Transfer was paused")]
    Paused,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Extractor failed: {0}")]
    Extractor(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Failure classes driving the retry supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Auto-retried with exponential backoff
    Transient,
    /// One automatic segment-level restart, then Failed
    ChecksumMismatch,
    /// Surfaced immediately, never retried
    Fatal,
    /// Not a failure: cooperative pause/cancel control flow
    Control,
}

impl PullmanError {
    /// Classify a task-boundary error for the recovery supervisor.
    pub fn classify(&self) -> FailureClass {
        match self {
            PullmanError::Network(e) => {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    FailureClass::Transient
                } else {
                    FailureClass::Fatal
                }
            }
            PullmanError::Timeout | PullmanError::StallTimeout { .. } => FailureClass::Transient,
            PullmanError::ServerError { status, .. } => {
                if *status >= 500 {
                    FailureClass::Transient
                } else {
                    FailureClass::Fatal
                }
            }
            PullmanError::Io(e) => match e.kind() {
                std::io::ErrorKind::PermissionDenied => FailureClass::Fatal,
                std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::UnexpectedEof => FailureClass::Transient,
                _ => FailureClass::Fatal,
            },
            PullmanError::ChecksumMismatch { .. } => FailureClass::ChecksumMismatch,
            PullmanError::Cancelled | PullmanError::Paused => FailureClass::Control,
            PullmanError::DiskFull(_)
            | PullmanError::PermissionDenied(_)
            | PullmanError::InvalidUrl(_)
            | PullmanError::Protocol(_)
            | PullmanError::Extractor(_)
            | PullmanError::NotFound(_)
            | PullmanError::TorrentNotFound(_)
            | PullmanError::Database(_)
            | PullmanError::InvalidOperation(_)
            | PullmanError::Serialization(_)
            | PullmanError::Unknown(_) => FailureClass::Fatal,
        }
    }

    /// Whether the retry supervisor may retry this error automatically.
    pub fn is_transient(&self) -> bool {
        self.classify() == FailureClass::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_split_on_500() {
        let transient = PullmanError::ServerError {
            status: 503,
            message: "busy".into(),
        };
        let fatal = PullmanError::ServerError {
            status: 404,
            message: "gone".into(),
        };
        assert_eq!(transient.classify(), FailureClass::Transient);
        assert_eq!(fatal.classify(), FailureClass::Fatal);
    }

    #[test]
    fn checksum_mismatch_has_its_own_class() {
        let e = PullmanError::ChecksumMismatch {
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert_eq!(e.classify(), FailureClass::ChecksumMismatch);
        assert!(!e.is_transient());
    }

    #[test]
    fn pause_and_cancel_are_control_flow() {
        assert_eq!(PullmanError::Paused.classify(), FailureClass::Control);
        assert_eq!(PullmanError::Cancelled.classify(), FailureClass::Control);
    }

    #[test]
    fn permission_denied_is_fatal() {
        let e = PullmanError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        assert_eq!(e.classify(), FailureClass::Fatal);
    }
}
