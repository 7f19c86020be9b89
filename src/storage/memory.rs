//! In-memory backends for tests and dry runs.
//!
//! Both stores can be switched into an unavailable mode in which every call
//! fails with a transient store error.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::error::{AppError, Result};
use crate::models::{
    ArtifactMetadata, ProcessingRecord, ProcessingStatus, RecordKey, StatusUpdate,
    normalize_creator,
};
use crate::storage::{ObjectStore, RecordTable};

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    content_type: String,
    last_modified: DateTime<Utc>,
}

/// Object store held in a map.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    unavailable: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object with an explicit modification time.
    pub async fn put_at(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        last_modified: DateTime<Utc>,
    ) {
        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
                last_modified,
            },
        );
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.objects.read().await.contains_key(key)
    }

    pub async fn read(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.read().await.get(key).map(|o| o.bytes.clone())
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(AppError::store("object store unavailable"))
        } else {
            Ok(())
        }
    }

    fn metadata(key: &str, object: &StoredObject) -> ArtifactMetadata {
        ArtifactMetadata {
            key: key.to_string(),
            size: object.bytes.len() as u64,
            last_modified: object.last_modified,
            content_type: Some(object.content_type.clone()),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        self.check_available()?;
        self.put_at(key, bytes, content_type, Utc::now()).await;
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<Option<ArtifactMetadata>> {
        self.check_available()?;
        Ok(self
            .objects
            .read()
            .await
            .get(key)
            .map(|object| Self::metadata(key, object)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ArtifactMetadata>> {
        self.check_available()?;
        Ok(self
            .objects
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| Self::metadata(key, object))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String> {
        self.check_available()?;
        Ok(format!("memory://{}?expires={}", key, ttl.as_secs()))
    }

    fn location(&self) -> String {
        "memory://".to_string()
    }
}

/// Record rows with the table's conditional semantics.
///
/// Shared by the in-memory and JSON-file record tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct RecordSet {
    rows: Vec<ProcessingRecord>,
}

impl RecordSet {
    fn position(&self, key: &RecordKey) -> Option<usize> {
        self.rows
            .iter()
            .position(|r| r.creator == key.creator && r.processing_date == key.day)
    }

    pub(crate) fn insert_if_idle(&mut self, record: &ProcessingRecord) -> bool {
        match self.position(&record.key()) {
            Some(index) if self.rows[index].status == ProcessingStatus::Processing => false,
            Some(index) => {
                self.rows[index] = record.clone();
                true
            }
            None => {
                self.rows.push(record.clone());
                true
            }
        }
    }

    pub(crate) fn update(
        &mut self,
        key: &RecordKey,
        update: &StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<ProcessingRecord> {
        let index = self
            .position(key)
            .ok_or_else(|| AppError::not_found(format!("record {key}")))?;
        let row = &mut self.rows[index];
        if let Some(attempt) = &update.attempt
            && !attempt.owns(row)
        {
            return Err(AppError::conflict(format!(
                "{key} is no longer owned by {attempt}"
            )));
        }
        if !row.status.can_transition_to(update.status) {
            return Err(AppError::transition(row.status, update.status));
        }
        row.apply(update, now);
        Ok(row.clone())
    }

    pub(crate) fn get(&self, key: &RecordKey) -> Option<ProcessingRecord> {
        self.position(key).map(|index| self.rows[index].clone())
    }

    pub(crate) fn query_creator(&self, creator: &str, limit: usize) -> Vec<ProcessingRecord> {
        let creator = normalize_creator(creator);
        let mut rows: Vec<ProcessingRecord> = self
            .rows
            .iter()
            .filter(|r| r.creator == creator)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.processing_date
                .cmp(&a.processing_date)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        rows.truncate(limit);
        rows
    }

    pub(crate) fn query_batch(&self, batch_id: &str) -> Vec<ProcessingRecord> {
        self.rows
            .iter()
            .filter(|r| r.batch_id == batch_id)
            .cloned()
            .collect()
    }

    pub(crate) fn query_status(
        &self,
        status: ProcessingStatus,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Vec<ProcessingRecord> {
        self.rows
            .iter()
            .filter(|r| r.status == status && r.processing_date >= from && r.processing_date <= to)
            .cloned()
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Record table held in memory.
#[derive(Debug, Default)]
pub struct MemoryRecordTable {
    rows: Mutex<RecordSet>,
    unavailable: AtomicBool,
}

impl MemoryRecordTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a row unconditionally.
    pub async fn seed(&self, record: ProcessingRecord) {
        let mut rows = self.rows.lock().await;
        if let Some(index) = rows.position(&record.key()) {
            rows.rows[index] = record;
        } else {
            rows.rows.push(record);
        }
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(AppError::store("record table unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RecordTable for MemoryRecordTable {
    async fn insert_if_idle(&self, record: &ProcessingRecord) -> Result<bool> {
        self.check_available()?;
        Ok(self.rows.lock().await.insert_if_idle(record))
    }

    async fn update(
        &self,
        key: &RecordKey,
        update: &StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<ProcessingRecord> {
        self.check_available()?;
        self.rows.lock().await.update(key, update, now)
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<ProcessingRecord>> {
        self.check_available()?;
        Ok(self.rows.lock().await.get(key))
    }

    async fn query_creator(&self, creator: &str, limit: usize) -> Result<Vec<ProcessingRecord>> {
        self.check_available()?;
        Ok(self.rows.lock().await.query_creator(creator, limit))
    }

    async fn query_batch(&self, batch_id: &str) -> Result<Vec<ProcessingRecord>> {
        self.check_available()?;
        Ok(self.rows.lock().await.query_batch(batch_id))
    }

    async fn query_status(
        &self,
        status: ProcessingStatus,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ProcessingRecord>> {
        self.check_available()?;
        Ok(self.rows.lock().await.query_status(status, from, to))
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}
