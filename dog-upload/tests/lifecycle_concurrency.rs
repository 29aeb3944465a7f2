use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use dog_upload::{
    BackendError, BackendOp, BlobKey, BlobLifecycleManager, BlobRecord, MemoryRecordStore,
    MemoryStorageBackend, MultipartPhase, NewBlob, RecordStore, UploadConfig, UploadError,
    UploadResult,
};

const MD5_OF_HELLO: &str = "XUFAKrxLKna5cZ2REBfFkg==";

fn create_test_manager(
    backend: MemoryStorageBackend,
) -> (Arc<BlobLifecycleManager>, MemoryRecordStore) {
    let records = MemoryRecordStore::new();
    let manager =
        BlobLifecycleManager::new(records.clone(), backend, UploadConfig::new("race-secret"))
            .unwrap();
    (Arc::new(manager), records)
}

/// Record store whose writes into one phase land late, so the storage side
/// effect of an operation is visible before its record write
struct SlowWrites {
    inner: MemoryRecordStore,
    phase: MultipartPhase,
    delay: Duration,
}

#[async_trait]
impl RecordStore for SlowWrites {
    async fn create(&self, record: BlobRecord) -> UploadResult<BlobRecord> {
        self.inner.create(record).await
    }

    async fn find(&self, key: &BlobKey) -> UploadResult<BlobRecord> {
        self.inner.find(key).await
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        record: BlobRecord,
    ) -> UploadResult<BlobRecord> {
        if record.phase() == self.phase {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.compare_and_swap(expected_version, record).await
    }

    async fn delete(&self, key: &BlobKey) -> UploadResult<()> {
        self.inner.delete(key).await
    }
}

fn create_slow_write_manager(
    backend: MemoryStorageBackend,
    phase: MultipartPhase,
) -> (BlobLifecycleManager, MemoryRecordStore) {
    let records = MemoryRecordStore::new();
    let slow = SlowWrites {
        inner: records.clone(),
        phase,
        delay: Duration::from_millis(100),
    };
    let manager = BlobLifecycleManager::new(slow, backend, UploadConfig::new("race-secret")).unwrap();
    (manager, records)
}

async fn create_test_record(manager: &BlobLifecycleManager) -> BlobRecord {
    manager
        .create_before_upload(NewBlob::new("big.iso", 4096, MD5_OF_HELLO))
        .await
        .unwrap()
}

/// Two begins racing through the backend: one wins, the other's session is released
#[tokio::test]
async fn test_concurrent_begin_leaves_one_session() {
    let backend = MemoryStorageBackend::new().with_latency(Duration::from_millis(20));
    let (manager, records) = create_test_manager(backend.clone());
    let record = create_test_record(&manager).await;

    let (first, second) = tokio::join!(
        manager.begin_multipart(&record),
        manager.begin_multipart(&record)
    );

    let (winner, loser) = match (first, second) {
        (Ok(winner), Err(loser)) | (Err(loser), Ok(winner)) => (winner, loser),
        other => panic!("expected exactly one begin to succeed, got {:?}", other),
    };
    assert!(matches!(loser, UploadError::InvalidState { .. }));

    assert_eq!(backend.initiated_sessions(), 2);
    assert_eq!(backend.aborted_sessions(), 1);
    assert_eq!(backend.open_sessions(), 1);

    let stored = records.find(&record.key).await.unwrap();
    assert_eq!(stored.phase(), MultipartPhase::Initiated);
    assert_eq!(stored.upload_session_id(), winner.upload_session_id());
}

/// Begin is refused up front once a session exists
#[tokio::test]
async fn test_sequential_begin_is_not_reentrant() {
    let backend = MemoryStorageBackend::new();
    let (manager, _) = create_test_manager(backend.clone());
    let record = create_test_record(&manager).await;

    let begun = manager.begin_multipart(&record).await.unwrap();
    let again = manager.begin_multipart(&begun).await;
    assert!(matches!(again, Err(UploadError::InvalidState { .. })));

    // A stale copy of the record is no way around it either
    let stale = manager.begin_multipart(&record).await;
    assert!(matches!(stale, Err(UploadError::InvalidState { .. })));
    assert_eq!(backend.initiated_sessions(), 1);
}

/// Part issuance racing completion must not stop completion from landing
#[tokio::test]
async fn test_parts_for_different_numbers_need_no_coordination() {
    let backend = MemoryStorageBackend::new().with_latency(Duration::from_millis(5));
    let (manager, records) = create_test_manager(backend.clone());
    let record = create_test_record(&manager).await;
    let record = manager.begin_multipart(&record).await.unwrap();

    let (one, two, three) = tokio::join!(
        manager.issue_part_upload_instructions(&record, 1, 10, MD5_OF_HELLO),
        manager.issue_part_upload_instructions(&record, 2, 10, MD5_OF_HELLO),
        manager.issue_part_upload_instructions(&record, 3, 10, MD5_OF_HELLO)
    );
    for result in [one, two, three] {
        assert!(result.is_ok());
    }

    let stored = records.find(&record.key).await.unwrap();
    assert_eq!(stored.phase(), MultipartPhase::InProgress);

    let session = stored.upload_session_id().cloned().unwrap();
    for part in 1..=3 {
        backend.put_part(&session, part, 10).unwrap();
    }
    let completed = manager.complete_multipart(&record).await.unwrap();
    assert_eq!(completed.phase(), MultipartPhase::Completed);
}

/// Complete and abort racing: whoever wins the swap decides the state
#[tokio::test]
async fn test_complete_and_abort_race_has_one_winner() {
    let backend = MemoryStorageBackend::new().with_latency(Duration::from_millis(20));
    let (manager, records) = create_test_manager(backend.clone());
    let record = create_test_record(&manager).await;
    let record = manager.begin_multipart(&record).await.unwrap();
    backend
        .put_part(record.upload_session_id().unwrap(), 1, 4096)
        .unwrap();

    let (completed, aborted) = tokio::join!(
        manager.complete_multipart(&record),
        manager.abort_multipart(&record)
    );

    let stored = records.find(&record.key).await.unwrap();
    match (completed, aborted) {
        (Ok(_), Err(err)) => {
            assert!(matches!(err, UploadError::InvalidState { .. }));
            assert_eq!(stored.phase(), MultipartPhase::Completed);
        }
        (Err(err), Ok(_)) => {
            assert!(matches!(err, UploadError::InvalidState { .. }));
            assert_eq!(stored.phase(), MultipartPhase::Aborted);
        }
        other => panic!("expected exactly one winner, got {:?}", other),
    }
}

/// Abort arriving after completion assembled the object, before its record write
#[tokio::test]
async fn test_abort_after_assembly_loses_to_completion() {
    let backend = MemoryStorageBackend::new();
    let (manager, records) = create_slow_write_manager(backend.clone(), MultipartPhase::Completed);
    let record = create_test_record(&manager).await;
    let record = manager.begin_multipart(&record).await.unwrap();
    backend
        .put_part(record.upload_session_id().unwrap(), 1, 5)
        .unwrap();

    let (completed, aborted) = tokio::join!(manager.complete_multipart(&record), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.abort_multipart(&record).await
    });

    let completed = completed.unwrap();
    assert_eq!(completed.phase(), MultipartPhase::Completed);
    assert!(matches!(aborted, Err(UploadError::InvalidState { .. })));

    let stored = records.find(&record.key).await.unwrap();
    assert_eq!(stored.phase(), MultipartPhase::Completed);
    assert_eq!(backend.object_size(&record.key), Some(5));
    assert!(manager.is_uploaded(&record).await.unwrap());
}

/// Completion arriving after abort released the session, before its record write
#[tokio::test]
async fn test_complete_after_release_loses_to_abort() {
    let backend = MemoryStorageBackend::new();
    let (manager, records) = create_slow_write_manager(backend.clone(), MultipartPhase::Aborted);
    let record = create_test_record(&manager).await;
    let record = manager.begin_multipart(&record).await.unwrap();
    backend
        .put_part(record.upload_session_id().unwrap(), 1, 5)
        .unwrap();

    let (aborted, completed) = tokio::join!(manager.abort_multipart(&record), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.complete_multipart(&record).await
    });

    let aborted = aborted.unwrap();
    assert_eq!(aborted.phase(), MultipartPhase::Aborted);
    let err = completed.unwrap_err();
    assert!(matches!(err, UploadError::InvalidState { .. }), "got {:?}", err);

    let stored = records.find(&record.key).await.unwrap();
    assert_eq!(stored.phase(), MultipartPhase::Aborted);
    assert_eq!(backend.object_size(&record.key), None);
    assert_eq!(backend.open_sessions(), 0);
}

/// Abort counts a session the backend already dropped as released
#[tokio::test]
async fn test_abort_tolerates_vanished_session() {
    let backend = MemoryStorageBackend::new();
    let (manager, _) = create_test_manager(backend.clone());
    let record = create_test_record(&manager).await;
    let record = manager.begin_multipart(&record).await.unwrap();

    backend.expire_session(record.upload_session_id().unwrap());

    let aborted = manager.abort_multipart(&record).await.unwrap();
    assert_eq!(aborted.phase(), MultipartPhase::Aborted);
    assert_eq!(aborted.upload_session_id(), record.upload_session_id());

    // Any other backend failure is surfaced and leaves the record alone
    let record = create_test_record(&manager).await;
    let record = manager.begin_multipart(&record).await.unwrap();
    backend.fail_next(BackendOp::AbortMultipart, BackendError::unavailable("timeout"));

    let err = manager.abort_multipart(&record).await.unwrap_err();
    assert!(err.is_retryable());
    let unchanged = manager.find(&record.key).await.unwrap();
    assert_eq!(unchanged.phase(), MultipartPhase::Initiated);
}

/// Failed backend calls never move local state
#[tokio::test]
async fn test_backend_failure_leaves_record_unchanged() {
    let backend = MemoryStorageBackend::new();
    let (manager, records) = create_test_manager(backend.clone());
    let record = create_test_record(&manager).await;

    backend.fail_next(BackendOp::InitiateMultipart, BackendError::unavailable("503"));
    let err = manager.begin_multipart(&record).await.unwrap_err();
    assert!(matches!(err, UploadError::BackendUnavailable { .. }));

    let stored = records.find(&record.key).await.unwrap();
    assert_eq!(stored.phase(), MultipartPhase::None);
    assert_eq!(stored.version, record.version);

    // Retrying after the outage succeeds
    assert!(manager.begin_multipart(&record).await.is_ok());
}

/// Keys never collide across many creations
#[tokio::test]
async fn test_keys_are_unique() {
    let (manager, records) = create_test_manager(MemoryStorageBackend::new());

    let mut keys = HashSet::new();
    for _ in 0..1000 {
        let record = create_test_record(&manager).await;
        assert!(keys.insert(record.key));
    }
    assert_eq!(records.len(), 1000);
}
