//! Pure computation for deduplication.
//!
//! - `fingerprint`: Deterministic content hashes and artifact names
//! - `partition`: Disjoint, size-balanced batch assignment
//! - `diff`: URL-set comparison
//! - `retry`: Bounded exponential backoff

pub mod diff;
pub mod fingerprint;
pub mod partition;
pub mod retry;

pub use diff::{UrlDiff, calculate_diff};
pub use fingerprint::{
    ContentComparison, ContentFingerprinter, HashAlgorithm, HashInfo, artifact_name,
};
pub use partition::{BatchPartitioner, IntegrityReport, validate_disjoint};
pub use retry::RetryPolicy;
