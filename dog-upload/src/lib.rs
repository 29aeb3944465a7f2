//! # dog-upload: direct-to-storage upload brokering
//!
//! `dog-upload` lets clients upload large files straight to object storage
//! while the application server only hands out short-lived, presigned
//! instructions and keeps a record of every blob.
//!
//! ## Key Features
//!
//! - **Direct uploads**: file bytes never pass through the application server
//! - **Multipart uploads**: one object, many independently uploaded parts
//! - **Signed references**: clients only ever see tamper-evident, expiring tokens
//! - **Storage agnostic**: S3-compatible backend included, in-memory backend for tests
//! - **Server agnostic**: plain request structs in, serializable responses out
//!
//! ## Quick Start
//!
//! ```rust
//! use dog_upload::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> UploadResult<()> {
//! let broker = UploadBroker::with_backend(
//!     MemoryRecordStore::new(),
//!     MemoryStorageBackend::new(),
//!     UploadConfig::new("change-me"),
//! )?;
//!
//! // 1. Register the blob and get a presigned PUT back
//! let blob = NewBlob::new("hello.txt", 5, "XUFAKrxLKna5cZ2REBfFkg==")
//!     .with_content_type("text/plain");
//! let response = broker.create(CreateBlobRequest::single(blob)).await?;
//!
//! // 2. The client PUTs the bytes to `direct_upload.url` with the given headers
//! let upload = response.direct_upload.expect("single upload instructions");
//! assert!(upload.headers.contains_key("Content-MD5"));
//!
//! // 3. Later requests name the blob through its signed reference
//! let record = broker.locate(BlobLocator::signed(response.signed_reference)).await?;
//! assert_eq!(record.filename, "hello.txt");
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │         UploadBroker         │  ← request structs in, responses out
//! ├──────────────────────────────┤
//! │     BlobLifecycleManager     │  ← multipart state machine, references
//! ├──────────────┬───────────────┤
//! │ RecordStore  │ StorageBackend│  ← blob records, presigned URLs
//! └──────────────┴───────────────┘
//! ```
//!
//! Records are only written through compare-and-swap on their version, so
//! concurrent requests for the same blob need no in-process lock.

pub mod backend;
pub mod broker;
mod config;
mod error;
mod lifecycle;
mod memory_backend;
mod record_store;
mod reference;
mod response;
mod s3_backend;
mod types;

// Re-export main types for clean API
pub use backend::{BackendError, BackendResult, StorageBackend};
pub use broker::UploadBroker;
pub use config::UploadConfig;
pub use error::{ErrorKind, UploadError, UploadResult};
pub use lifecycle::BlobLifecycleManager;
pub use memory_backend::{BackendOp, MemoryStorageBackend};
pub use record_store::{MemoryRecordStore, RecordStore};
pub use reference::{ReferenceError, SignedReferenceCodec};
pub use response::{BlobLocator, BlobView, CreateBlobRequest, DirectUploadResponse, PartUploadRequest};
pub use s3_backend::{S3Config, S3StorageBackend};
pub use types::{
    BlobKey, BlobRecord, Checksum, ChecksumAlgorithm, DirectUpload, MultipartPhase, MultipartState,
    NewBlob, UploadSessionId,
};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        BlobLifecycleManager, BlobLocator, BlobRecord, CreateBlobRequest, DirectUploadResponse,
        MemoryRecordStore, MemoryStorageBackend, NewBlob, PartUploadRequest, UploadBroker,
        UploadConfig, UploadError, UploadResult,
    };
}
