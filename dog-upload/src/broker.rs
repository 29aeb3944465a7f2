use std::sync::Arc;

use tracing::{info, warn};

use crate::types::validate_byte_size;
use crate::{
    BlobLifecycleManager, BlobLocator, BlobRecord, BlobView, Checksum, CreateBlobRequest,
    DirectUpload, DirectUploadResponse, MultipartPhase, PartUploadRequest, RecordStore,
    StorageBackend, UploadConfig, UploadResult,
};

/// Request-facing entry point for direct uploads.
///
/// This is what a web handler embeds. Every operation maps onto one lifecycle
/// manager call, takes explicit request structs and returns a serializable
/// [`DirectUploadResponse`]; no transport is assumed.
#[derive(Clone)]
pub struct UploadBroker {
    manager: Arc<BlobLifecycleManager>,
}

impl UploadBroker {
    pub fn new(manager: BlobLifecycleManager) -> Self {
        Self {
            manager: Arc::new(manager),
        }
    }

    /// Build a broker and its lifecycle manager in one step
    pub fn with_backend<R, B>(records: R, backend: B, config: UploadConfig) -> UploadResult<Self>
    where
        R: RecordStore + 'static,
        B: StorageBackend + 'static,
    {
        Ok(Self::new(BlobLifecycleManager::new(records, backend, config)?))
    }

    pub fn manager(&self) -> &BlobLifecycleManager {
        &self.manager
    }

    /// Register a blob and return the first upload instructions.
    ///
    /// Single-shot requests get a presigned PUT. Multipart requests begin the
    /// session straight away and carry no instructions; parts are requested
    /// one by one through [`Self::generate_part_url`].
    pub async fn create(&self, request: CreateBlobRequest) -> UploadResult<DirectUploadResponse> {
        let record = self.manager.create_before_upload(request.blob).await?;

        if request.multipart {
            let record = self.manager.begin_multipart(&record).await?;
            return Ok(self.respond(&record, None));
        }

        let upload = self.manager.issue_single_upload_instructions(&record).await?;
        Ok(self.respond(&record, Some(upload)))
    }

    /// Presigned instructions for one part of an open multipart upload
    pub async fn generate_part_url(
        &self,
        locator: BlobLocator,
        part_number: u32,
        request: PartUploadRequest,
    ) -> UploadResult<DirectUploadResponse> {
        validate_byte_size(request.byte_size, self.manager.config().max_byte_size)?;
        Checksum::parse(&request.checksum)?;

        let record = self.locate(locator).await?;
        let upload = self
            .manager
            .issue_part_upload_instructions(&record, part_number, request.byte_size, &request.checksum)
            .await?;

        let record = self.manager.find(&record.key).await?;
        Ok(self.respond(&record, Some(upload)))
    }

    pub async fn complete_multipart(&self, locator: BlobLocator) -> UploadResult<DirectUploadResponse> {
        let record = self.locate(locator).await?;
        let record = self.manager.complete_multipart(&record).await?;
        Ok(self.respond(&record, None))
    }

    /// Abort the upload, then delete the record.
    ///
    /// The two steps are separate writes. A record left `Aborted` because the
    /// delete failed is simply deleted on the next call.
    pub async fn abort_multipart(&self, locator: BlobLocator) -> UploadResult<()> {
        let record = self.locate(locator).await?;

        let record = if record.phase() == MultipartPhase::Aborted {
            warn!(key = %record.key, "Record already aborted, finishing cleanup");
            record
        } else {
            self.manager.abort_multipart(&record).await?
        };

        self.manager.discard(&record).await?;
        info!(key = %record.key, "Multipart upload aborted and record removed");
        Ok(())
    }

    /// Turn a locator into the current record
    pub async fn locate(&self, locator: BlobLocator) -> UploadResult<BlobRecord> {
        match locator {
            BlobLocator::Signed(reference) => self.manager.resolve(&reference).await,
            BlobLocator::Trusted(key) => self.manager.find(&key).await,
        }
    }

    fn respond(&self, record: &BlobRecord, direct_upload: Option<DirectUpload>) -> DirectUploadResponse {
        DirectUploadResponse {
            blob: BlobView::from(record),
            signed_reference: self.manager.signed_reference(record),
            direct_upload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryRecordStore, MemoryStorageBackend, NewBlob, UploadError};

    const CHECKSUM: &str = "XUFAKrxLKna5cZ2REBfFkg==";

    fn broker() -> UploadBroker {
        UploadBroker::with_backend(
            MemoryRecordStore::new(),
            MemoryStorageBackend::new(),
            UploadConfig::new("broker-secret"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn part_requests_are_validated_before_lookup() {
        let broker = broker();
        let locator = BlobLocator::signed("not-a-reference");

        let negative = broker
            .generate_part_url(locator.clone(), 1, PartUploadRequest::new(-1, CHECKSUM))
            .await;
        assert!(matches!(negative, Err(UploadError::InvalidMetadata { .. })));

        let bad_checksum = broker
            .generate_part_url(locator.clone(), 1, PartUploadRequest::new(5, "nope"))
            .await;
        assert!(matches!(bad_checksum, Err(UploadError::InvalidMetadata { .. })));

        let unresolved = broker
            .generate_part_url(locator, 1, PartUploadRequest::new(5, CHECKSUM))
            .await;
        assert!(matches!(unresolved, Err(UploadError::InvalidReference)));
    }

    #[tokio::test]
    async fn create_single_returns_put_instructions() {
        let broker = broker();
        let response = broker
            .create(CreateBlobRequest::single(NewBlob::new("a.txt", 5, CHECKSUM)))
            .await
            .unwrap();

        let upload = response.direct_upload.unwrap();
        assert!(upload.url.starts_with("memory://"));
        assert_eq!(response.blob.multipart_state, MultipartPhase::None);

        let record = broker
            .locate(BlobLocator::signed(response.signed_reference))
            .await
            .unwrap();
        assert_eq!(record.filename, "a.txt");
    }

    #[tokio::test]
    async fn trusted_locator_skips_verification() {
        let broker = broker();
        let response = broker
            .create(CreateBlobRequest::multipart(NewBlob::new("a.bin", 5, CHECKSUM)))
            .await
            .unwrap();
        assert!(response.direct_upload.is_none());
        assert_eq!(response.blob.multipart_state, MultipartPhase::Initiated);

        let key = broker
            .locate(BlobLocator::signed(response.signed_reference))
            .await
            .unwrap()
            .key;
        let completed = broker.complete_multipart(BlobLocator::Trusted(key)).await;
        assert!(matches!(completed, Err(UploadError::IncompleteUpload { .. })));
    }
}
