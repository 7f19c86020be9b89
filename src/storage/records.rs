//! JSON-file record table for local runs.
//!
//! All rows live in a single `records.json`. Every operation reloads the
//! file under a lock and rewrites it atomically, so concurrent tasks in one
//! process observe the same compare-and-set semantics as the remote table.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::models::{ProcessingRecord, ProcessingStatus, RecordKey, StatusUpdate};
use crate::storage::RecordTable;
use crate::storage::memory::RecordSet;

const RECORDS_FILE: &str = "records.json";

/// Record table persisted as a JSON file.
#[derive(Debug)]
pub struct LocalRecordTable {
    path: PathBuf,
    lock: Mutex<()>,
}

impl LocalRecordTable {
    /// Table stored at `{dir}/records.json`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(RECORDS_FILE),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<RecordSet> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RecordSet::default()),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    async fn save(&self, rows: &RecordSet) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(rows)?;
        let tmp = self.path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordTable for LocalRecordTable {
    async fn insert_if_idle(&self, record: &ProcessingRecord) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut rows = self.load().await?;
        let inserted = rows.insert_if_idle(record);
        if inserted {
            self.save(&rows).await?;
        }
        Ok(inserted)
    }

    async fn update(
        &self,
        key: &RecordKey,
        update: &StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<ProcessingRecord> {
        let _guard = self.lock.lock().await;
        let mut rows = self.load().await?;
        let updated = rows.update(key, update, now)?;
        self.save(&rows).await?;
        Ok(updated)
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<ProcessingRecord>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.get(key))
    }

    async fn query_creator(&self, creator: &str, limit: usize) -> Result<Vec<ProcessingRecord>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.query_creator(creator, limit))
    }

    async fn query_batch(&self, batch_id: &str) -> Result<Vec<ProcessingRecord>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.query_batch(batch_id))
    }

    async fn query_status(
        &self,
        status: ProcessingStatus,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ProcessingRecord>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.query_status(status, from, to))
    }

    async fn ping(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.load().await.map(|_| ())
    }
}
