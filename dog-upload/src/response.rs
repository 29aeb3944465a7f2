use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BlobKey, BlobRecord, DirectUpload, MultipartPhase, NewBlob};

/// Serializable projection of a blob record handed back to clients.
///
/// Only these fields leave the service; the raw key, the storage session
/// handle and the record version do not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobView {
    pub filename: String,
    pub content_type: String,
    pub byte_size: u64,
    pub checksum: String,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub multipart_state: MultipartPhase,
    pub created_at: DateTime<Utc>,
}

impl From<&BlobRecord> for BlobView {
    fn from(record: &BlobRecord) -> Self {
        Self {
            filename: record.filename.clone(),
            content_type: record.content_type.clone(),
            byte_size: record.byte_size,
            checksum: record.checksum.to_string(),
            metadata: record.metadata.clone(),
            multipart_state: record.phase(),
            created_at: record.created_at,
        }
    }
}

/// Response of every broker operation that returns a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectUploadResponse {
    #[serde(flatten)]
    pub blob: BlobView,
    pub signed_reference: String,
    /// Instructions for the next client upload, when there is one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_upload: Option<DirectUpload>,
}

/// Input of the broker's create operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateBlobRequest {
    #[serde(flatten)]
    pub blob: NewBlob,
    /// Begin a multipart upload right away instead of issuing a single PUT
    #[serde(default)]
    pub multipart: bool,
}

impl CreateBlobRequest {
    pub fn single(blob: NewBlob) -> Self {
        Self {
            blob,
            multipart: false,
        }
    }

    pub fn multipart(blob: NewBlob) -> Self {
        Self {
            blob,
            multipart: true,
        }
    }
}

/// Declared size and digest of one multipart part
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartUploadRequest {
    pub byte_size: i64,
    pub checksum: String,
}

impl PartUploadRequest {
    pub fn new<C: Into<String>>(byte_size: i64, checksum: C) -> Self {
        Self {
            byte_size,
            checksum: checksum.into(),
        }
    }
}

/// How a caller names the record it wants to act on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobLocator {
    /// Signed reference presented by an untrusted client
    Signed(String),
    /// Raw key, for internal callers only
    Trusted(BlobKey),
}

impl BlobLocator {
    pub fn signed<S: Into<String>>(reference: S) -> Self {
        Self::Signed(reference.into())
    }
}
