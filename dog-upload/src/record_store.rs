use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::{BlobKey, BlobRecord, UploadError, UploadResult};

/// Durable keyed storage for blob records.
///
/// Every write is atomic per key. `compare_and_swap` is the only way to change
/// an existing record, which lets concurrent lifecycle operations on the same
/// key race safely without an in-process lock.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a new record; fails with `DuplicateKey` if the key is taken
    async fn create(&self, record: BlobRecord) -> UploadResult<BlobRecord>;

    /// Fetch a record by key; fails with `NotFound`
    async fn find(&self, key: &BlobKey) -> UploadResult<BlobRecord>;

    /// Replace the stored record if its version still equals `expected_version`.
    ///
    /// On success the stored copy has its version bumped and is returned.
    /// Fails with `StaleRecord` if another writer got there first.
    async fn compare_and_swap(
        &self,
        expected_version: u64,
        record: BlobRecord,
    ) -> UploadResult<BlobRecord>;

    /// Remove a record; fails with `NotFound` if it is already gone
    async fn delete(&self, key: &BlobKey) -> UploadResult<()>;
}

/// In-memory record store for tests and development
#[derive(Clone, Default)]
pub struct MemoryRecordStore {
    records: Arc<RwLock<HashMap<BlobKey, BlobRecord>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn contains(&self, key: &BlobKey) -> bool {
        self.records.read().contains_key(key)
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create(&self, mut record: BlobRecord) -> UploadResult<BlobRecord> {
        let mut records = self.records.write();
        if records.contains_key(&record.key) {
            return Err(UploadError::DuplicateKey {
                key: record.key.to_string(),
            });
        }

        record.version = 1;
        records.insert(record.key.clone(), record.clone());
        Ok(record)
    }

    async fn find(&self, key: &BlobKey) -> UploadResult<BlobRecord> {
        self.records
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| UploadError::not_found(key.as_str()))
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        mut record: BlobRecord,
    ) -> UploadResult<BlobRecord> {
        let mut records = self.records.write();
        let stored = records
            .get_mut(&record.key)
            .ok_or_else(|| UploadError::not_found(record.key.as_str()))?;

        if stored.version != expected_version {
            return Err(UploadError::StaleRecord {
                key: record.key.to_string(),
            });
        }

        record.version = expected_version + 1;
        record.updated_at = Utc::now();
        *stored = record.clone();
        Ok(record)
    }

    async fn delete(&self, key: &BlobKey) -> UploadResult<()> {
        self.records
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| UploadError::not_found(key.as_str()))
    }
}
