//! Application configuration structures.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Collage rendering parameters (part of every fingerprint)
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Collision detection and fingerprint settings
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Processing state table settings
    #[serde(default)]
    pub state: StateConfig,

    /// Object store placement
    #[serde(default)]
    pub storage: StorageConfig,

    /// Backoff for transient store errors
    #[serde(default)]
    pub retry: RetryConfig,

    /// Batch partitioning thresholds
    #[serde(default)]
    pub partition: PartitionConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        self.processing.validate()?;

        if self.dedup.hash_algorithm.trim().is_empty() {
            return Err(AppError::config("dedup.hash_algorithm is empty"));
        }
        if self.dedup.artifact_extension.trim().is_empty() {
            return Err(AppError::config("dedup.artifact_extension is empty"));
        }
        if self.dedup.integrity_min_bytes > self.dedup.integrity_max_bytes {
            return Err(AppError::config(
                "dedup.integrity_min_bytes must not exceed dedup.integrity_max_bytes",
            ));
        }
        if self.state.table_name.trim().is_empty() {
            return Err(AppError::config("state.table_name is empty"));
        }
        if self.state.retention_days == 0 {
            return Err(AppError::config("state.retention_days must be > 0"));
        }
        if self.state.stale_after_minutes == 0 {
            return Err(AppError::config("state.stale_after_minutes must be > 0"));
        }
        if self.state.history_limit == 0 {
            return Err(AppError::config("state.history_limit must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::config("retry.max_attempts must be > 0"));
        }
        if self.retry.factor < 1.0 {
            return Err(AppError::config("retry.factor must be >= 1.0"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(AppError::config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms",
            ));
        }
        self.partition.validate()
    }
}

/// Rendering parameters for a creator's collage.
///
/// Serialized into every content fingerprint, so changing any field produces
/// a different artifact key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessingConfig {
    /// Grid rows
    #[serde(default = "defaults::rows")]
    pub rows: u32,

    /// Grid columns
    #[serde(default = "defaults::cols")]
    pub cols: u32,

    /// JPEG quality (1-100)
    #[serde(default = "defaults::quality")]
    pub quality: u8,

    /// Maximum images composed per creator
    #[serde(default = "defaults::max_images_per_creator")]
    pub max_images_per_creator: usize,

    /// Concurrent downloads / creators in flight
    #[serde(default = "defaults::max_workers")]
    pub max_workers: usize,

    /// Per-request timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,

    /// Download attempts per URL
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            rows: defaults::rows(),
            cols: defaults::cols(),
            quality: defaults::quality(),
            max_images_per_creator: defaults::max_images_per_creator(),
            max_workers: defaults::max_workers(),
            timeout_secs: defaults::timeout(),
            max_retries: defaults::max_retries(),
        }
    }
}

impl ProcessingConfig {
    /// Check every bound, reporting all violations at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.rows == 0 {
            errors.push("rows must be positive");
        }
        if self.cols == 0 {
            errors.push("cols must be positive");
        }
        if !(1..=100).contains(&self.quality) {
            errors.push("quality must be between 1 and 100");
        }
        if self.max_images_per_creator == 0 {
            errors.push("max_images_per_creator must be positive");
        }
        if self.max_workers == 0 {
            errors.push("max_workers must be positive");
        }
        if self.max_workers > 20 {
            errors.push("max_workers must not exceed 20");
        }
        if self.timeout_secs == 0 {
            errors.push("timeout must be positive");
        }
        if self.timeout_secs > 300 {
            errors.push("timeout must not exceed 300 seconds");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::config(format!(
                "processing config invalid: {}",
                errors.join("; ")
            )))
        }
    }

    /// Apply per-request overrides and validate the result.
    pub fn merged(&self, overrides: &ProcessingOverrides) -> Result<Self> {
        let merged = Self {
            rows: overrides.rows.unwrap_or(self.rows),
            cols: overrides.cols.unwrap_or(self.cols),
            quality: overrides.quality.unwrap_or(self.quality),
            max_images_per_creator: overrides
                .max_images_per_creator
                .unwrap_or(self.max_images_per_creator),
            max_workers: overrides.max_workers.unwrap_or(self.max_workers),
            timeout_secs: overrides.timeout_secs.unwrap_or(self.timeout_secs),
            max_retries: overrides.max_retries.unwrap_or(self.max_retries),
        };
        merged.validate()?;
        Ok(merged)
    }

    /// Number of cells in the collage grid.
    pub fn grid_cells(&self) -> usize {
        self.rows as usize * self.cols as usize
    }
}

/// Optional per-request changes to [`ProcessingConfig`].
///
/// Unknown keys are rejected at deserialization time.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProcessingOverrides {
    #[serde(default)]
    pub rows: Option<u32>,
    #[serde(default)]
    pub cols: Option<u32>,
    #[serde(default)]
    pub quality: Option<u8>,
    #[serde(default)]
    pub max_images_per_creator: Option<usize>,
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default, alias = "timeout")]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// Collision detection and fingerprint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Master switch; disabled means every creator is produced
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Produce even when an identical artifact exists
    #[serde(default)]
    pub force_reprocess: bool,

    /// Digest used for fingerprints and batch hashing
    #[serde(default = "defaults::hash_algorithm")]
    pub hash_algorithm: String,

    /// Existing artifacts smaller than this are treated as partial writes
    #[serde(default = "defaults::min_artifact_bytes")]
    pub min_artifact_bytes: u64,

    /// Lower size bound for integrity validation
    #[serde(default = "defaults::integrity_min_bytes")]
    pub integrity_min_bytes: u64,

    /// Upper size bound for integrity validation
    #[serde(default = "defaults::integrity_max_bytes")]
    pub integrity_max_bytes: u64,

    /// Age after which integrity validation adds an advisory warning
    #[serde(default = "defaults::integrity_max_age_days")]
    pub integrity_max_age_days: i64,

    /// File extension of produced artifacts
    #[serde(default = "defaults::artifact_extension")]
    pub artifact_extension: String,

    /// Content types accepted by integrity validation
    #[serde(default = "defaults::allowed_content_types")]
    pub allowed_content_types: Vec<String>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            force_reprocess: false,
            hash_algorithm: defaults::hash_algorithm(),
            min_artifact_bytes: defaults::min_artifact_bytes(),
            integrity_min_bytes: defaults::integrity_min_bytes(),
            integrity_max_bytes: defaults::integrity_max_bytes(),
            integrity_max_age_days: defaults::integrity_max_age_days(),
            artifact_extension: defaults::artifact_extension(),
            allowed_content_types: defaults::allowed_content_types(),
        }
    }
}

/// Processing state table settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Table holding one record per (creator, day)
    #[serde(default = "defaults::table_name")]
    pub table_name: String,

    /// Secondary index keyed by batch id
    #[serde(default = "defaults::batch_index")]
    pub batch_index: String,

    /// Secondary index keyed by (status, day)
    #[serde(default = "defaults::status_index")]
    pub status_index: String,

    /// Days a record lives before it expires
    #[serde(default = "defaults::retention_days")]
    pub retention_days: i64,

    /// Age after which a `processing` record is presumed abandoned
    #[serde(default = "defaults::stale_after_minutes")]
    pub stale_after_minutes: i64,

    /// Records fetched when deciding whether a creator was processed
    #[serde(default = "defaults::history_limit")]
    pub history_limit: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            table_name: defaults::table_name(),
            batch_index: defaults::batch_index(),
            status_index: defaults::status_index(),
            retention_days: defaults::retention_days(),
            stale_after_minutes: defaults::stale_after_minutes(),
            history_limit: defaults::history_limit(),
        }
    }
}

/// Object store placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Bucket receiving produced artifacts
    #[serde(default = "defaults::output_bucket")]
    pub output_bucket: String,

    /// Key prefix under which `collages/` lives
    #[serde(default)]
    pub output_prefix: String,

    /// Root directory for the local backends
    #[serde(default = "defaults::local_root")]
    pub local_root: String,

    /// Lifetime of generated download links
    #[serde(default = "defaults::presigned_url_ttl")]
    pub presigned_url_ttl_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_bucket: defaults::output_bucket(),
            output_prefix: String::new(),
            local_root: defaults::local_root(),
            presigned_url_ttl_secs: defaults::presigned_url_ttl(),
        }
    }
}

/// Backoff for transient store errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(default = "defaults::base_delay")]
    pub base_delay_ms: u64,

    /// Cap applied to every delay
    #[serde(default = "defaults::max_delay")]
    pub max_delay_ms: u64,

    /// Multiplier between consecutive delays
    #[serde(default = "defaults::factor")]
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            base_delay_ms: defaults::base_delay(),
            max_delay_ms: defaults::max_delay(),
            factor: defaults::factor(),
        }
    }
}

/// Batch partitioning thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Target URL count per batch
    #[serde(default = "defaults::target_batch_size")]
    pub target_batch_size: usize,

    /// Preferred batch accepted while below `target * factor`
    #[serde(default = "defaults::preferred_overflow")]
    pub preferred_overflow_factor: f64,

    /// Alternative batches beyond `target * factor` are never chosen
    #[serde(default = "defaults::max_overflow")]
    pub max_overflow_factor: f64,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            target_batch_size: defaults::target_batch_size(),
            preferred_overflow_factor: defaults::preferred_overflow(),
            max_overflow_factor: defaults::max_overflow(),
        }
    }
}

impl PartitionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.target_batch_size == 0 {
            return Err(AppError::config("partition.target_batch_size must be > 0"));
        }
        if self.preferred_overflow_factor < 1.0 {
            return Err(AppError::config(
                "partition.preferred_overflow_factor must be >= 1.0",
            ));
        }
        if self.max_overflow_factor < self.preferred_overflow_factor {
            return Err(AppError::config(
                "partition.max_overflow_factor must be >= preferred_overflow_factor",
            ));
        }
        Ok(())
    }
}

mod defaults {
    // Processing defaults
    pub fn rows() -> u32 {
        5
    }
    pub fn cols() -> u32 {
        7
    }
    pub fn quality() -> u8 {
        95
    }
    pub fn max_images_per_creator() -> usize {
        35
    }
    pub fn max_workers() -> usize {
        8
    }
    pub fn timeout() -> u64 {
        30
    }
    pub fn max_retries() -> u32 {
        3
    }

    // Dedup defaults
    pub fn enabled() -> bool {
        true
    }
    pub fn hash_algorithm() -> String {
        "sha256".into()
    }
    pub fn min_artifact_bytes() -> u64 {
        100 * 1024
    }
    pub fn integrity_min_bytes() -> u64 {
        50 * 1024
    }
    pub fn integrity_max_bytes() -> u64 {
        50 * 1024 * 1024
    }
    pub fn integrity_max_age_days() -> i64 {
        30
    }
    pub fn artifact_extension() -> String {
        "jpg".into()
    }
    pub fn allowed_content_types() -> Vec<String> {
        vec!["image/jpeg".into(), "image/jpg".into()]
    }

    // State defaults
    pub fn table_name() -> String {
        "creator-processing-state".into()
    }
    pub fn batch_index() -> String {
        "batch-id-index".into()
    }
    pub fn status_index() -> String {
        "status-date-index".into()
    }
    pub fn retention_days() -> i64 {
        30
    }
    pub fn stale_after_minutes() -> i64 {
        30
    }
    pub fn history_limit() -> usize {
        10
    }

    // Storage defaults
    pub fn output_bucket() -> String {
        "collage-output".into()
    }
    pub fn local_root() -> String {
        "storage".into()
    }
    pub fn presigned_url_ttl() -> u64 {
        3600
    }

    // Retry defaults
    pub fn max_attempts() -> u32 {
        3
    }
    pub fn base_delay() -> u64 {
        200
    }
    pub fn max_delay() -> u64 {
        5_000
    }
    pub fn factor() -> f64 {
        2.0
    }

    // Partition defaults
    pub fn target_batch_size() -> usize {
        100
    }
    pub fn preferred_overflow() -> f64 {
        1.5
    }
    pub fn max_overflow() -> f64 {
        2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config_ok() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_reports_every_processing_violation() {
        let config = ProcessingConfig {
            rows: 0,
            quality: 0,
            max_workers: 21,
            timeout_secs: 301,
            ..ProcessingConfig::default()
        };
        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("rows must be positive"));
        assert!(message.contains("quality must be between 1 and 100"));
        assert!(message.contains("max_workers must not exceed 20"));
        assert!(message.contains("timeout must not exceed 300 seconds"));
    }

    #[test]
    fn test_merged_applies_only_given_fields() {
        let base = ProcessingConfig::default();
        let overrides = ProcessingOverrides {
            rows: Some(2),
            cols: Some(2),
            quality: Some(90),
            ..Default::default()
        };
        let merged = base.merged(&overrides).unwrap();
        assert_eq!(merged.rows, 2);
        assert_eq!(merged.cols, 2);
        assert_eq!(merged.quality, 90);
        assert_eq!(merged.max_workers, base.max_workers);
    }

    #[test]
    fn test_merged_rejects_out_of_range() {
        let overrides = ProcessingOverrides {
            quality: Some(101),
            ..Default::default()
        };
        assert!(matches!(
            ProcessingConfig::default().merged(&overrides),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn test_overrides_reject_unknown_keys() {
        let parsed: std::result::Result<ProcessingOverrides, _> =
            serde_json::from_str(r#"{"rows": 3, "colour": "red"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [processing]
            rows = 3

            [state]
            stale_after_minutes = 45
            "#,
        )
        .unwrap();
        assert_eq!(config.processing.rows, 3);
        assert_eq!(config.processing.cols, 7);
        assert_eq!(config.state.stale_after_minutes, 45);
        assert_eq!(config.state.retention_days, 30);
        assert_eq!(config.dedup.min_artifact_bytes, 100 * 1024);
    }

    #[test]
    fn test_validate_rejects_inverted_partition_factors() {
        let mut config = Config::default();
        config.partition.max_overflow_factor = 1.2;
        assert!(config.validate().is_err());
    }
}
