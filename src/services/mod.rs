//! Service layer for the deduplication core.
//!
//! This module contains the I/O-bearing logic for:
//! - Artifact collision detection (`CollisionDetector`)
//! - Per-creator processing state (`ProcessingStateStore`)
//! - Batch orchestration around a renderer (`CreatorScheduler`)

mod collision;
mod scheduler;
mod state;

pub use collision::{
    ArtifactDetails, CleanupReport, CollisionDetector, CollisionStatistics, DeleteFailure,
    IntegrityCheck, IntegrityResult, SizeDistribution, SkipDecision, SkipReason,
};
pub use scheduler::{
    BatchOutcome, CreatorScheduler, JobAction, JobOutcome, RenderReport, Renderer,
};
pub use state::{
    BatchStatus, CreatorStatus, DailyStatistics, HealthStatus, ProcessedDecision,
    ProcessedReason, ProcessingStateStore, ProcessingStatistics,
};
