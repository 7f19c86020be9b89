//! Storage abstractions for artifacts and processing records.
//!
//! Two seams:
//! - [`ObjectStore`]: durable blobs (produced artifacts), probed by key and prefix
//! - [`RecordTable`]: one [`ProcessingRecord`] per (creator, day) with a
//!   conditional insert and a guarded status update
//!
//! ## Backends
//!
//! ```text
//! local    LocalObjectStore / LocalRecordTable   development, CLI
//! memory   MemoryObjectStore / MemoryRecordTable tests
//! s3       S3ObjectStore                         Lambda (feature "aws")
//! dynamo   DynamoRecordTable                     Lambda (feature "aws")
//! ```

pub mod local;
pub mod memory;
pub mod records;

#[cfg(feature = "aws")]
pub mod dynamo;
#[cfg(feature = "aws")]
pub mod s3;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::Result;
use crate::models::{ArtifactMetadata, ProcessingRecord, ProcessingStatus, RecordKey, StatusUpdate};

// Re-export for convenience
pub use local::LocalObjectStore;
pub use memory::{MemoryObjectStore, MemoryRecordTable};
pub use records::LocalRecordTable;

#[cfg(feature = "aws")]
pub use dynamo::DynamoRecordTable;
#[cfg(feature = "aws")]
pub use s3::S3ObjectStore;

/// Durable object store holding produced artifacts.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write an object, replacing any existing one.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;

    /// Existence and metadata probe. Never downloads content.
    async fn head(&self, key: &str) -> Result<Option<ArtifactMetadata>>;

    /// Every object whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<ArtifactMetadata>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Time-limited download link.
    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String>;

    /// Human-readable location, e.g. `s3://bucket`.
    fn location(&self) -> String;
}

/// Keyed record table with compare-and-set writes.
#[async_trait]
pub trait RecordTable: Send + Sync {
    /// Insert `record` unless the row for its key is currently `processing`.
    ///
    /// Returns `false` when an in-flight row already owns the key. The check
    /// and the write are a single atomic step.
    async fn insert_if_idle(&self, record: &ProcessingRecord) -> Result<bool>;

    /// Apply a status update to an existing row.
    ///
    /// Fails with `NotFound` when the row is missing and with
    /// `InvalidTransition` when its current status cannot move to the new
    /// one. The check and the write are a single atomic step.
    async fn update(
        &self,
        key: &RecordKey,
        update: &StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<ProcessingRecord>;

    async fn get(&self, key: &RecordKey) -> Result<Option<ProcessingRecord>>;

    /// Most recent rows for a creator identity, newest day first.
    async fn query_creator(&self, creator: &str, limit: usize) -> Result<Vec<ProcessingRecord>>;

    /// Every row tagged with a batch id.
    async fn query_batch(&self, batch_id: &str) -> Result<Vec<ProcessingRecord>>;

    /// Rows with `status` whose processing day lies in `from..=to`.
    async fn query_status(
        &self,
        status: ProcessingStatus,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ProcessingRecord>>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<()>;
}
