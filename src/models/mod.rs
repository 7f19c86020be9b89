// src/models/mod.rs

//! Domain models for the deduplication core.
//!
//! This module contains the plain data structures shared by the pipeline,
//! services and storage backends, organized by their primary purpose.

mod artifact;
mod batch;
mod config;
mod creator;
mod record;

// Re-export all public types
pub use artifact::{ArtifactMetadata, content_type_for};
pub use batch::{Batch, CreatorMap, PartitionStats, PartitionerState};
pub use config::{
    Config, DedupConfig, PartitionConfig, ProcessingConfig, ProcessingOverrides, RetryConfig,
    StateConfig, StorageConfig,
};
pub use creator::{Creator, normalize_creator, sanitize_creator};
pub use record::{
    AttemptId, ProcessingRecord, ProcessingStatus, RecordKey, StatusUpdate, processing_day,
};
