use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::backend::{BackendError, StorageBackend};
use crate::types::validate_byte_size;
use crate::{
    BlobKey, BlobRecord, Checksum, DirectUpload, MultipartPhase, MultipartState, NewBlob,
    RecordStore, SignedReferenceCodec, UploadConfig, UploadError, UploadResult, UploadSessionId,
};

/// Owns the upload state machine of blob records.
///
/// The manager holds no per-key state of its own. Every change to a record is
/// a compare-and-swap against the [`RecordStore`], and local state is only
/// written after the storage backend has answered, so concurrent requests
/// for the same key race at the store and nowhere else.
pub struct BlobLifecycleManager {
    records: Arc<dyn RecordStore>,
    backend: Arc<dyn StorageBackend>,
    codec: SignedReferenceCodec,
    config: UploadConfig,
}

impl BlobLifecycleManager {
    pub fn new<R, B>(records: R, backend: B, config: UploadConfig) -> UploadResult<Self>
    where
        R: RecordStore + 'static,
        B: StorageBackend + 'static,
    {
        Self::from_shared(Arc::new(records), Arc::new(backend), config)
    }

    /// Build from collaborators that are already shared elsewhere
    pub fn from_shared(
        records: Arc<dyn RecordStore>,
        backend: Arc<dyn StorageBackend>,
        config: UploadConfig,
    ) -> UploadResult<Self> {
        config.validate()?;
        Ok(Self {
            codec: SignedReferenceCodec::new(config.signing_secret.clone()),
            records,
            backend,
            config,
        })
    }

    /// Register a record for a blob that has not been uploaded yet.
    ///
    /// Nothing is reserved on the storage side for single-shot uploads.
    pub async fn create_before_upload(&self, blob: NewBlob) -> UploadResult<BlobRecord> {
        let record = blob.into_record(BlobKey::new(), self.config.max_byte_size)?;
        let record = self.records.create(record).await?;

        info!(
            key = %record.key,
            byte_size = record.byte_size,
            content_type = %record.content_type,
            "Created blob record ahead of direct upload"
        );
        Ok(record)
    }

    /// Presigned single-shot PUT for a record that is not using multipart
    pub async fn issue_single_upload_instructions(
        &self,
        record: &BlobRecord,
    ) -> UploadResult<DirectUpload> {
        record
            .multipart
            .ensure_unstarted("issue single upload instructions")?;

        let upload = self
            .backend
            .generate_upload_url(
                &record.key,
                record.byte_size,
                &record.checksum,
                &record.content_type,
                self.config.upload_url_ttl,
            )
            .await?;

        debug!(key = %record.key, "Issued single upload instructions");
        Ok(upload)
    }

    /// Open a multipart session for a fresh record.
    ///
    /// Not idempotent: a second call is refused before the backend is touched.
    /// If two calls race past the state check, the one that loses the
    /// compare-and-swap aborts the session it just opened.
    pub async fn begin_multipart(&self, record: &BlobRecord) -> UploadResult<BlobRecord> {
        let current = self.records.find(&record.key).await?;
        current.multipart.ensure_unstarted("begin multipart")?;

        let session = self
            .backend
            .initiate_multipart(&current.key, &current.content_type)
            .await?;

        let opened = session.clone();
        let result = self
            .transition(current, move |state| state.initiate(opened.clone()))
            .await;

        match result {
            Ok(saved) => {
                info!(key = %saved.key, upload_session_id = %session, "Began multipart upload");
                Ok(saved)
            }
            Err(err) => {
                warn!(
                    key = %record.key,
                    upload_session_id = %session,
                    error = %err,
                    "Lost multipart begin, releasing backend session"
                );
                self.release_session(&record.key, &session).await;
                Err(err)
            }
        }
    }

    /// Presigned PUT for one part of an open multipart upload.
    ///
    /// Parts may be requested in any order and any number of times; which
    /// parts actually landed is tracked by the backend only.
    pub async fn issue_part_upload_instructions(
        &self,
        record: &BlobRecord,
        part_number: u32,
        byte_size: i64,
        checksum: &str,
    ) -> UploadResult<DirectUpload> {
        if part_number == 0 || part_number > self.config.max_parts {
            return Err(UploadError::invalid_metadata(format!(
                "Invalid part number: {} (must be 1-{})",
                part_number, self.config.max_parts
            )));
        }
        let byte_size = validate_byte_size(byte_size, self.config.max_byte_size)?;
        let checksum = Checksum::parse(checksum)?;

        let current = self.records.find(&record.key).await?;
        let session = current
            .multipart
            .open_session("issue part upload instructions")?
            .clone();

        let upload = self
            .backend
            .generate_part_upload_url(
                &current.key,
                &session,
                part_number,
                byte_size,
                &checksum,
                self.config.upload_url_ttl,
            )
            .await?;

        if current.phase() == MultipartPhase::Initiated {
            let saved = self.transition(current, |state| state.advance()).await?;
            info!(key = %saved.key, upload_session_id = %session, "Multipart upload in progress");
        }

        debug!(key = %record.key, part_number, "Issued part upload instructions");
        Ok(upload)
    }

    /// Ask the backend to assemble the uploaded parts and mark the record completed.
    ///
    /// Missing parts leave the record untouched. A retry after a lost response
    /// observes `InvalidState` because the record is already completed, and so
    /// does a completion that lost its session to a concurrent abort.
    pub async fn complete_multipart(&self, record: &BlobRecord) -> UploadResult<BlobRecord> {
        let current = self.records.find(&record.key).await?;
        let session = current.multipart.open_session("complete multipart")?.clone();

        if let Err(err) = self.backend.complete_multipart(&current.key, &session).await {
            warn!(key = %current.key, upload_session_id = %session, error = %err, "Multipart completion failed");
            if let BackendError::SessionNotFound(_) = err {
                // The session was released by a concurrent abort (or expired); its
                // record write may not have landed yet.
                let latest = self.records.find(&current.key).await?;
                latest.multipart.open_session("complete multipart")?;
                return Err(UploadError::invalid_state(format!(
                    "cannot complete multipart: session {} was released",
                    session
                )));
            }
            return Err(err.into());
        }

        let saved = self.transition(current, |state| state.complete()).await?;
        info!(key = %saved.key, upload_session_id = %session, "Completed multipart upload");
        Ok(saved)
    }

    /// Release the backend session and mark the record aborted.
    ///
    /// A session the backend no longer knows about counts as released, unless
    /// the object was assembled from it, in which case a completion won and the
    /// abort fails with `InvalidState`. The record itself is kept; deleting it
    /// is a separate step ([`Self::discard`]).
    pub async fn abort_multipart(&self, record: &BlobRecord) -> UploadResult<BlobRecord> {
        let current = self.records.find(&record.key).await?;
        let session = current.multipart.open_session("abort multipart")?.clone();

        match self.backend.abort_multipart(&current.key, &session).await {
            Ok(()) => {}
            Err(BackendError::SessionNotFound(_)) => {
                // A session consumed by completion leaves an assembled object behind.
                if self.backend.object_exists(&current.key).await? {
                    warn!(
                        key = %current.key,
                        upload_session_id = %session,
                        "Multipart session was completed concurrently, refusing abort"
                    );
                    return Err(UploadError::invalid_state(format!(
                        "cannot abort multipart: session {} was already completed",
                        session
                    )));
                }
                warn!(
                    key = %current.key,
                    upload_session_id = %session,
                    "Multipart session already gone on backend, accepting abort"
                );
            }
            Err(err) => return Err(err.into()),
        }

        let saved = self.transition(current, |state| state.abort()).await?;
        info!(key = %saved.key, upload_session_id = %session, "Aborted multipart upload");
        Ok(saved)
    }

    /// Delete a record from the store
    pub async fn discard(&self, record: &BlobRecord) -> UploadResult<()> {
        self.records.delete(&record.key).await?;
        info!(key = %record.key, multipart_state = %record.phase(), "Discarded blob record");
        Ok(())
    }

    /// Whether the finalized object exists in storage.
    ///
    /// Multipart records only have an object once completed. The state is
    /// read from the store, not from the caller's copy.
    pub async fn is_uploaded(&self, record: &BlobRecord) -> UploadResult<bool> {
        let current = self.records.find(&record.key).await?;
        match current.phase() {
            MultipartPhase::None | MultipartPhase::Completed => {
                Ok(self.backend.object_exists(&current.key).await?)
            }
            _ => Ok(false),
        }
    }

    /// Look a record up by its raw key; only for trusted callers
    pub async fn find(&self, key: &BlobKey) -> UploadResult<BlobRecord> {
        self.records.find(key).await
    }

    /// Look a record up through a signed reference
    pub async fn resolve(&self, signed_reference: &str) -> UploadResult<BlobRecord> {
        let key = self.codec.verify(signed_reference).map_err(|reason| {
            debug!(reason = %reason, "Rejected signed reference");
            UploadError::InvalidReference
        })?;
        self.records.find(&key).await
    }

    /// Fresh signed reference for handing to an untrusted client
    pub fn signed_reference(&self, record: &BlobRecord) -> String {
        self.codec
            .sign(&record.key, expiry_after(self.config.reference_ttl))
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn codec(&self) -> &SignedReferenceCodec {
        &self.codec
    }

    /// Apply a state transition with compare-and-swap, re-reading on conflict.
    ///
    /// `next_state` is re-evaluated against every re-read, so a transition that
    /// became illegal in the meantime fails with `InvalidState`.
    async fn transition<F>(&self, mut current: BlobRecord, next_state: F) -> UploadResult<BlobRecord>
    where
        F: Fn(&MultipartState) -> UploadResult<MultipartState> + Send + Sync,
    {
        loop {
            let next = next_state(&current.multipart)?;
            if next == current.multipart {
                return Ok(current);
            }

            let expected = current.version;
            match self
                .records
                .compare_and_swap(expected, current.with_multipart(next))
                .await
            {
                Ok(saved) => return Ok(saved),
                Err(UploadError::StaleRecord { .. }) => {
                    debug!(key = %current.key, "Blob record changed concurrently, re-reading");
                    current = self.records.find(&current.key).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Best-effort abort of a backend session no record refers to
    async fn release_session(&self, key: &BlobKey, session: &UploadSessionId) {
        if let Err(err) = self.backend.abort_multipart(key, session).await {
            warn!(
                key = %key,
                upload_session_id = %session,
                error = %err,
                "Failed to release orphaned multipart session"
            );
        }
    }
}

fn expiry_after(ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
