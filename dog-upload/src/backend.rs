use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::{BlobKey, Checksum, DirectUpload, UploadError, UploadSessionId};

/// Result type for storage backend calls
pub type BackendResult<T> = Result<T, BackendError>;

/// Failures reported by a storage backend adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Transient infrastructure failure; the caller may retry with backoff
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Permanent validation failure on the backend side
    #[error("backend rejected request: {0}")]
    Rejected(String),

    /// The multipart session does not exist (never created, aborted or expired)
    #[error("multipart session not found: {0}")]
    SessionNotFound(String),

    /// Completion was requested before every part landed
    #[error("multipart upload incomplete: {0}")]
    IncompleteParts(String),
}

impl BackendError {
    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn rejected<S: Into<String>>(message: S) -> Self {
        Self::Rejected(message.into())
    }
}

impl From<BackendError> for UploadError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable(message) => UploadError::unavailable(message),
            BackendError::Rejected(message) => UploadError::rejected(message),
            BackendError::SessionNotFound(session) => {
                UploadError::rejected(format!("multipart session {} no longer exists", session))
            }
            BackendError::IncompleteParts(message) => UploadError::incomplete(message),
        }
    }
}

/// Object-storage capabilities needed to broker direct uploads.
///
/// Implementations only talk to the storage service; they never touch blob
/// records. Part bookkeeping for multipart sessions lives entirely on the
/// backend side.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Presigned single-shot PUT bound to the key, size and checksum
    async fn generate_upload_url(
        &self,
        key: &BlobKey,
        byte_size: u64,
        checksum: &Checksum,
        content_type: &str,
        expires_in: Duration,
    ) -> BackendResult<DirectUpload>;

    /// Open a multipart session for `key`
    async fn initiate_multipart(
        &self,
        key: &BlobKey,
        content_type: &str,
    ) -> BackendResult<UploadSessionId>;

    /// Presigned PUT for a single part of an open session
    async fn generate_part_upload_url(
        &self,
        key: &BlobKey,
        session: &UploadSessionId,
        part_number: u32,
        byte_size: u64,
        checksum: &Checksum,
        expires_in: Duration,
    ) -> BackendResult<DirectUpload>;

    /// Assemble every uploaded part into the final object
    async fn complete_multipart(
        &self,
        key: &BlobKey,
        session: &UploadSessionId,
    ) -> BackendResult<()>;

    /// Release the session and any part storage
    async fn abort_multipart(
        &self,
        key: &BlobKey,
        session: &UploadSessionId,
    ) -> BackendResult<()>;

    /// Whether a finalized object exists under `key`
    async fn object_exists(&self, key: &BlobKey) -> BackendResult<bool>;
}

/// Headers a client must send with a direct PUT so the backend can verify it
pub fn direct_upload_headers(
    checksum: &Checksum,
    content_type: Option<&str>,
    byte_size: u64,
) -> Vec<(String, String)> {
    let mut headers = vec![
        (
            checksum.algorithm().header_name().to_string(),
            checksum.as_str().to_string(),
        ),
        ("Content-Length".to_string(), byte_size.to_string()),
    ];
    if let Some(content_type) = content_type {
        headers.push(("Content-Type".to_string(), content_type.to_string()));
    }
    headers
}
