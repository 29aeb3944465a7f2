use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::{UploadError, UploadResult};

pub(crate) const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Unique identifier of a blob record, shared with the storage namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobKey(pub String);

impl BlobKey {
    /// Generate a new random key
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Create from existing string
    pub fn from_string(key: String) -> Self {
        Self(key)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BlobKey {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BlobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BlobKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// Opaque multipart session handle issued by the storage backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadSessionId(pub String);

impl UploadSessionId {
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UploadSessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UploadSessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Digest algorithms accepted for client-declared checksums
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Md5,
    Sha256,
}

impl ChecksumAlgorithm {
    fn from_digest_len(len: usize) -> Option<Self> {
        match len {
            16 => Some(Self::Md5),
            32 => Some(Self::Sha256),
            _ => None,
        }
    }

    /// Request header that carries this digest on a direct upload
    pub fn header_name(&self) -> &'static str {
        match self {
            Self::Md5 => "Content-MD5",
            Self::Sha256 => "x-amz-checksum-sha256",
        }
    }
}

/// Base64-encoded content digest, validated on construction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum {
    algorithm: ChecksumAlgorithm,
    encoded: String,
}

impl Checksum {
    /// Parse a base64 digest; only MD5 and SHA-256 digest lengths are recognized
    pub fn parse(encoded: &str) -> UploadResult<Self> {
        let encoded = encoded.trim();
        let digest = STANDARD.decode(encoded).map_err(|_| {
            UploadError::invalid_metadata(format!("checksum '{}' is not valid base64", encoded))
        })?;

        let algorithm = ChecksumAlgorithm::from_digest_len(digest.len()).ok_or_else(|| {
            UploadError::invalid_metadata(format!(
                "checksum decodes to {} bytes, expected an MD5 (16) or SHA-256 (32) digest",
                digest.len()
            ))
        })?;

        Ok(Self {
            algorithm,
            encoded: encoded.to_string(),
        })
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }
}

impl TryFrom<String> for Checksum {
    type Error = UploadError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Checksum> for String {
    fn from(checksum: Checksum) -> Self {
        checksum.encoded
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encoded)
    }
}

/// Coarse multipart phase, without the session handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultipartPhase {
    None,
    Initiated,
    InProgress,
    Completed,
    Aborted,
}

impl MultipartPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Initiated => "initiated",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for MultipartPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Multipart sub-state of a blob record.
///
/// Every variant except `None` carries the backend session handle, so a record
/// can never hold a session id without a multipart state or the reverse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "upload_session_id", rename_all = "snake_case")]
pub enum MultipartState {
    None,
    Initiated(UploadSessionId),
    InProgress(UploadSessionId),
    Completed(UploadSessionId),
    Aborted(UploadSessionId),
}

impl Default for MultipartState {
    fn default() -> Self {
        Self::None
    }
}

impl MultipartState {
    pub fn phase(&self) -> MultipartPhase {
        match self {
            Self::None => MultipartPhase::None,
            Self::Initiated(_) => MultipartPhase::Initiated,
            Self::InProgress(_) => MultipartPhase::InProgress,
            Self::Completed(_) => MultipartPhase::Completed,
            Self::Aborted(_) => MultipartPhase::Aborted,
        }
    }

    pub fn upload_session_id(&self) -> Option<&UploadSessionId> {
        match self {
            Self::None => None,
            Self::Initiated(id)
            | Self::InProgress(id)
            | Self::Completed(id)
            | Self::Aborted(id) => Some(id),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Aborted(_))
    }

    /// `None -> Initiated`
    pub fn initiate(&self, session: UploadSessionId) -> UploadResult<Self> {
        self.ensure_unstarted("begin multipart")
            .map(|_| Self::Initiated(session))
    }

    /// Fails unless no multipart upload was ever begun
    pub fn ensure_unstarted(&self, operation: &str) -> UploadResult<()> {
        match self {
            Self::None => Ok(()),
            other => Err(Self::refuse(operation, other.phase())),
        }
    }

    /// Session handle of an open (initiated or in-progress) multipart upload
    pub fn open_session(&self, operation: &str) -> UploadResult<&UploadSessionId> {
        match self {
            Self::Initiated(id) | Self::InProgress(id) => Ok(id),
            other => Err(Self::refuse(operation, other.phase())),
        }
    }

    /// `Initiated -> InProgress`, idempotent once in progress
    pub fn advance(&self) -> UploadResult<Self> {
        self.open_session("issue part upload instructions")
            .map(|id| Self::InProgress(id.clone()))
    }

    /// `Initiated | InProgress -> Completed`
    pub fn complete(&self) -> UploadResult<Self> {
        self.open_session("complete multipart")
            .map(|id| Self::Completed(id.clone()))
    }

    /// `Initiated | InProgress -> Aborted`
    pub fn abort(&self) -> UploadResult<Self> {
        self.open_session("abort multipart")
            .map(|id| Self::Aborted(id.clone()))
    }

    fn refuse(operation: &str, phase: MultipartPhase) -> UploadError {
        UploadError::invalid_state(format!(
            "cannot {} while multipart state is {}",
            operation, phase
        ))
    }
}

/// Client-declared description of a blob about to be uploaded
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewBlob {
    pub filename: String,
    pub content_type: Option<String>,
    /// Signed so that negative sizes coming off the wire can be rejected explicitly
    pub byte_size: i64,
    pub checksum: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl NewBlob {
    pub fn new<F: Into<String>, C: Into<String>>(filename: F, byte_size: i64, checksum: C) -> Self {
        Self {
            filename: filename.into(),
            content_type: None,
            byte_size,
            checksum: checksum.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_metadata<K: Into<String>, V: Into<serde_json::Value>>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Validate the declaration and turn it into a fresh record under `key`
    pub(crate) fn into_record(self, key: BlobKey, max_byte_size: u64) -> UploadResult<BlobRecord> {
        let filename = self.filename.trim().to_string();
        if filename.is_empty() {
            return Err(UploadError::invalid_metadata("filename must not be empty"));
        }

        let byte_size = validate_byte_size(self.byte_size, max_byte_size)?;
        let checksum = Checksum::parse(&self.checksum)?;

        if let Some((name, _)) = self
            .metadata
            .iter()
            .find(|(_, value)| value.is_array() || value.is_object())
        {
            return Err(UploadError::invalid_metadata(format!(
                "metadata value for '{}' must be a scalar",
                name
            )));
        }

        let content_type = self
            .content_type
            .filter(|ct| !ct.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        let now = Utc::now();
        Ok(BlobRecord {
            key,
            filename,
            content_type,
            byte_size,
            checksum,
            metadata: self.metadata,
            multipart: MultipartState::None,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }
}

pub(crate) fn validate_byte_size(byte_size: i64, max_byte_size: u64) -> UploadResult<u64> {
    let size = u64::try_from(byte_size).map_err(|_| {
        UploadError::invalid_metadata(format!("byte size must be >= 0, got {}", byte_size))
    })?;
    if size > max_byte_size {
        return Err(UploadError::invalid_metadata(format!(
            "byte size {} exceeds maximum {}",
            size, max_byte_size
        )));
    }
    Ok(size)
}

/// Bookkeeping for one logical uploaded object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobRecord {
    pub key: BlobKey,
    pub filename: String,
    pub content_type: String,
    pub byte_size: u64,
    pub checksum: Checksum,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub multipart: MultipartState,

    /// Bumped by the record store on every successful write
    pub version: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BlobRecord {
    pub fn phase(&self) -> MultipartPhase {
        self.multipart.phase()
    }

    pub fn upload_session_id(&self) -> Option<&UploadSessionId> {
        self.multipart.upload_session_id()
    }

    /// Copy of this record carrying a new multipart state
    pub fn with_multipart(&self, multipart: MultipartState) -> Self {
        Self {
            multipart,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }
}

/// Storage-service instructions for one direct upload request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectUpload {
    pub url: String,
    pub headers: BTreeMap<String, String>,
}

impl DirectUpload {
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}
