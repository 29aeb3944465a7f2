use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for upload operations
pub type UploadResult<T> = Result<T, UploadError>;

/// Errors surfaced by the lifecycle manager and the upload broker
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Invalid blob metadata: {message}")]
    InvalidMetadata { message: String },

    #[error("Invalid or expired signed reference")]
    InvalidReference,

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Upload incomplete: {message}")]
    IncompleteUpload { message: String },

    #[error("Storage backend unavailable: {message}")]
    BackendUnavailable { message: String },

    #[error("Storage backend rejected the request: {message}")]
    BackendRejected { message: String },

    #[error("Blob not found: {key}")]
    NotFound { key: String },

    #[error("Blob key already exists: {key}")]
    DuplicateKey { key: String },

    #[error("Blob record {key} was modified concurrently")]
    StaleRecord { key: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Record store error: {source}")]
    Store {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Stable, transport-agnostic classification of an [`UploadError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidMetadata,
    InvalidReference,
    InvalidState,
    IncompleteUpload,
    BackendUnavailable,
    BackendRejected,
    NotFound,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidMetadata => "invalid_metadata",
            ErrorKind::InvalidReference => "invalid_reference",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::IncompleteUpload => "incomplete_upload",
            ErrorKind::BackendUnavailable => "backend_unavailable",
            ErrorKind::BackendRejected => "backend_rejected",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Internal => "internal",
        }
    }

    /// HTTP status an outer layer would most likely map this kind to
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::InvalidMetadata => 422,
            ErrorKind::InvalidReference => 400,
            ErrorKind::InvalidState => 409,
            ErrorKind::IncompleteUpload => 409,
            ErrorKind::BackendUnavailable => 503,
            ErrorKind::BackendRejected => 502,
            ErrorKind::NotFound => 404,
            ErrorKind::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl UploadError {
    pub fn invalid_metadata<S: Into<String>>(message: S) -> Self {
        Self::InvalidMetadata {
            message: message.into(),
        }
    }

    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    pub fn incomplete<S: Into<String>>(message: S) -> Self {
        Self::IncompleteUpload {
            message: message.into(),
        }
    }

    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Self::BackendUnavailable {
            message: message.into(),
        }
    }

    pub fn rejected<S: Into<String>>(message: S) -> Self {
        Self::BackendRejected {
            message: message.into(),
        }
    }

    pub fn not_found<S: Into<String>>(key: S) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Wrap a failure coming out of a [`crate::RecordStore`] implementation
    pub fn store<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Store {
            source: Box::new(error),
        }
    }

    /// Stable kind for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidMetadata { .. } => ErrorKind::InvalidMetadata,
            Self::InvalidReference => ErrorKind::InvalidReference,
            // A lost compare-and-swap means the state moved underneath the caller.
            Self::InvalidState { .. } | Self::StaleRecord { .. } => ErrorKind::InvalidState,
            Self::IncompleteUpload { .. } => ErrorKind::IncompleteUpload,
            Self::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            Self::BackendRejected { .. } => ErrorKind::BackendRejected,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::DuplicateKey { .. }
            | Self::Configuration { .. }
            | Self::Store { .. } => ErrorKind::Internal,
        }
    }

    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable { .. } | Self::IncompleteUpload { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_record_reports_as_invalid_state() {
        let err = UploadError::StaleRecord { key: "abc".into() };
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(!err.is_retryable());
    }

    #[test]
    fn only_transient_kinds_are_retryable() {
        assert!(UploadError::unavailable("timeout").is_retryable());
        assert!(UploadError::incomplete("part 2 missing").is_retryable());
        assert!(!UploadError::rejected("bad checksum").is_retryable());
        assert!(!UploadError::InvalidReference.is_retryable());
    }

    #[test]
    fn kind_serializes_as_snake_case() {
        let json = serde_json::to_string(&ErrorKind::BackendUnavailable).unwrap();
        assert_eq!(json, "\"backend_unavailable\"");
        assert_eq!(ErrorKind::InvalidState.status_code(), 409);
    }
}
