use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::backend::{direct_upload_headers, BackendError, BackendResult, StorageBackend};
use crate::{BlobKey, Checksum, DirectUpload, UploadSessionId};

/// Backend operations, used to target injected faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    GenerateUploadUrl,
    InitiateMultipart,
    GeneratePartUploadUrl,
    CompleteMultipart,
    AbortMultipart,
    ObjectExists,
}

#[derive(Debug, Clone)]
struct MemorySession {
    key: BlobKey,
    parts: BTreeMap<u32, u64>,
}

/// In-process storage backend for tests and development.
///
/// Issues `memory://` URLs instead of real presigned requests and keeps
/// multipart sessions, landed parts and finalized objects in memory. Client
/// uploads are simulated with [`MemoryStorageBackend::put_object`] and
/// [`MemoryStorageBackend::put_part`].
#[derive(Clone, Default)]
pub struct MemoryStorageBackend {
    bucket: String,
    latency: Option<Duration>,
    sessions: Arc<RwLock<HashMap<UploadSessionId, MemorySession>>>,
    objects: Arc<RwLock<HashMap<BlobKey, u64>>>,
    faults: Arc<RwLock<HashMap<BackendOp, VecDeque<BackendError>>>>,
    initiated: Arc<AtomicUsize>,
    aborted: Arc<AtomicUsize>,
}

impl MemoryStorageBackend {
    pub fn new() -> Self {
        Self {
            bucket: "uploads".to_string(),
            ..Self::default()
        }
    }

    /// Delay every call, so concurrent callers interleave at the backend
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make the next call of `op` fail with `error`
    pub fn fail_next(&self, op: BackendOp, error: BackendError) {
        self.faults.write().entry(op).or_default().push_back(error);
    }

    /// Simulate a client finishing a single-shot PUT
    pub fn put_object(&self, key: &BlobKey, byte_size: u64) {
        self.objects.write().insert(key.clone(), byte_size);
    }

    /// Simulate a client uploading one part; re-uploads replace the part
    pub fn put_part(
        &self,
        session: &UploadSessionId,
        part_number: u32,
        byte_size: u64,
    ) -> BackendResult<()> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(session)
            .ok_or_else(|| BackendError::SessionNotFound(session.to_string()))?;
        session.parts.insert(part_number, byte_size);
        Ok(())
    }

    /// Drop a session as if the storage service had expired it
    pub fn expire_session(&self, session: &UploadSessionId) {
        self.sessions.write().remove(session);
    }

    /// Sessions currently open on the backend
    pub fn open_sessions(&self) -> usize {
        self.sessions.read().len()
    }

    /// Total number of sessions ever initiated
    pub fn initiated_sessions(&self) -> usize {
        self.initiated.load(Ordering::SeqCst)
    }

    /// Total number of successful abort calls
    pub fn aborted_sessions(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn object_size(&self, key: &BlobKey) -> Option<u64> {
        self.objects.read().get(key).copied()
    }

    async fn enter(&self, op: BackendOp) -> BackendResult<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        match self.faults.write().get_mut(&op).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn url(&self, key: &BlobKey, expires_in: Duration, query: &str) -> String {
        let ttl = i64::try_from(expires_in.as_secs()).unwrap_or(i64::MAX);
        let expires_at = Utc::now().timestamp().saturating_add(ttl);
        format!(
            "memory://{}/{}?{}X-Expires={}",
            self.bucket, key, query, expires_at
        )
    }
}

#[async_trait]
impl StorageBackend for MemoryStorageBackend {
    async fn generate_upload_url(
        &self,
        key: &BlobKey,
        byte_size: u64,
        checksum: &Checksum,
        content_type: &str,
        expires_in: Duration,
    ) -> BackendResult<DirectUpload> {
        self.enter(BackendOp::GenerateUploadUrl).await?;

        let upload = direct_upload_headers(checksum, Some(content_type), byte_size)
            .into_iter()
            .fold(DirectUpload::new(self.url(key, expires_in, "")), |u, (k, v)| {
                u.with_header(k, v)
            });
        Ok(upload)
    }

    async fn initiate_multipart(
        &self,
        key: &BlobKey,
        _content_type: &str,
    ) -> BackendResult<UploadSessionId> {
        self.enter(BackendOp::InitiateMultipart).await?;

        let id = UploadSessionId::from_string(format!("mpu_{}", Uuid::new_v4().simple()));
        self.sessions.write().insert(
            id.clone(),
            MemorySession {
                key: key.clone(),
                parts: BTreeMap::new(),
            },
        );
        self.initiated.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn generate_part_upload_url(
        &self,
        key: &BlobKey,
        session: &UploadSessionId,
        part_number: u32,
        byte_size: u64,
        checksum: &Checksum,
        expires_in: Duration,
    ) -> BackendResult<DirectUpload> {
        self.enter(BackendOp::GeneratePartUploadUrl).await?;

        match self.sessions.read().get(session) {
            Some(open) if &open.key == key => {}
            Some(_) => {
                return Err(BackendError::rejected(format!(
                    "session {} belongs to another object",
                    session
                )))
            }
            None => return Err(BackendError::SessionNotFound(session.to_string())),
        }

        let query = format!("uploadId={}&partNumber={}&", session, part_number);
        let upload = direct_upload_headers(checksum, None, byte_size)
            .into_iter()
            .fold(DirectUpload::new(self.url(key, expires_in, &query)), |u, (k, v)| {
                u.with_header(k, v)
            });
        Ok(upload)
    }

    async fn complete_multipart(
        &self,
        key: &BlobKey,
        session: &UploadSessionId,
    ) -> BackendResult<()> {
        self.enter(BackendOp::CompleteMultipart).await?;

        let mut sessions = self.sessions.write();
        let open = sessions
            .get(session)
            .ok_or_else(|| BackendError::SessionNotFound(session.to_string()))?;

        let last = match open.parts.keys().next_back() {
            Some(last) => *last,
            None => return Err(BackendError::IncompleteParts("no parts uploaded".to_string())),
        };
        if let Some(missing) = (1..=last).find(|n| !open.parts.contains_key(n)) {
            return Err(BackendError::IncompleteParts(format!("missing part {}", missing)));
        }

        let size: u64 = open.parts.values().sum();
        sessions.remove(session);
        self.objects.write().insert(key.clone(), size);
        Ok(())
    }

    async fn abort_multipart(
        &self,
        _key: &BlobKey,
        session: &UploadSessionId,
    ) -> BackendResult<()> {
        self.enter(BackendOp::AbortMultipart).await?;

        self.sessions
            .write()
            .remove(session)
            .ok_or_else(|| BackendError::SessionNotFound(session.to_string()))?;
        self.aborted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn object_exists(&self, key: &BlobKey) -> BackendResult<bool> {
        self.enter(BackendOp::ObjectExists).await?;
        Ok(self.objects.read().contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checksum() -> Checksum {
        Checksum::parse("XUFAKrxLKna5cZ2REBfFkg==").unwrap()
    }

    #[tokio::test]
    async fn complete_requires_contiguous_parts() {
        let backend = MemoryStorageBackend::new();
        let key = BlobKey::new();
        let session = backend.initiate_multipart(&key, "video/mp4").await.unwrap();

        let empty = backend.complete_multipart(&key, &session).await;
        assert!(matches!(empty, Err(BackendError::IncompleteParts(_))));

        backend.put_part(&session, 2, 10).unwrap();
        let gap = backend.complete_multipart(&key, &session).await;
        assert_eq!(gap, Err(BackendError::IncompleteParts("missing part 1".into())));

        backend.put_part(&session, 1, 5).unwrap();
        backend.complete_multipart(&key, &session).await.unwrap();
        assert_eq!(backend.object_size(&key), Some(15));
        assert_eq!(backend.open_sessions(), 0);
        assert!(backend.object_exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn abort_reports_vanished_sessions() {
        let backend = MemoryStorageBackend::new();
        let key = BlobKey::new();
        let session = backend.initiate_multipart(&key, "video/mp4").await.unwrap();

        backend.abort_multipart(&key, &session).await.unwrap();
        let again = backend.abort_multipart(&key, &session).await;
        assert!(matches!(again, Err(BackendError::SessionNotFound(_))));
        assert_eq!(backend.aborted_sessions(), 1);
    }

    #[tokio::test]
    async fn injected_faults_fire_once() {
        let backend = MemoryStorageBackend::new();
        let key = BlobKey::new();
        backend.fail_next(BackendOp::GenerateUploadUrl, BackendError::unavailable("down"));

        let first = backend
            .generate_upload_url(&key, 5, &checksum(), "text/plain", Duration::from_secs(60))
            .await;
        assert_eq!(first, Err(BackendError::unavailable("down")));

        let second = backend
            .generate_upload_url(&key, 5, &checksum(), "text/plain", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(second.url.starts_with(&format!("memory://uploads/{}", key)));
        assert_eq!(second.headers.get("Content-MD5").map(String::as_str), Some(checksum().as_str()));
    }

    #[tokio::test]
    async fn huge_expiry_saturates() {
        let backend = MemoryStorageBackend::new();
        let upload = backend
            .generate_upload_url(&BlobKey::new(), 5, &checksum(), "text/plain", Duration::MAX)
            .await
            .unwrap();
        assert!(upload.url.ends_with(&format!("X-Expires={}", i64::MAX)));
    }

    #[tokio::test]
    async fn part_urls_are_bound_to_their_session() {
        let backend = MemoryStorageBackend::new();
        let key = BlobKey::new();
        let session = backend.initiate_multipart(&key, "video/mp4").await.unwrap();

        let part = backend
            .generate_part_upload_url(&key, &session, 3, 10, &checksum(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(part.url.contains("partNumber=3"));
        assert!(part.url.contains(session.as_str()));

        let other = backend
            .generate_part_upload_url(&BlobKey::new(), &session, 1, 10, &checksum(), Duration::from_secs(60))
            .await;
        assert!(matches!(other, Err(BackendError::Rejected(_))));
    }
}
