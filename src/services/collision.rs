// src/services/collision.rs

//! Pre-production collision detection against stored artifacts.
//!
//! Artifacts are written to a key derived from the content fingerprint, so
//! an identical (creator, URLs, config) always maps to the same object. A
//! probe of that key tells whether production can be skipped.
//!
//! Detection fails open: any store error yields "do not skip".

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::error::Result;
use crate::models::{ArtifactMetadata, Config, DedupConfig, ProcessingConfig, sanitize_creator};
use crate::pipeline::{ContentFingerprinter, RetryPolicy, artifact_name};
use crate::storage::ObjectStore;
use crate::utils::join_key;

const COLLAGES_DIR: &str = "collages/";
const MIB: u64 = 1024 * 1024;

/// Why production was or was not skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum SkipReason {
    DedupDisabled,
    ForceReprocess,
    IdenticalExists { size: u64 },
    ExistingTooSmall { size: u64, min_size: u64 },
    ContentChanged { previous: usize },
    FirstProduction,
    CheckFailed { error: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DedupDisabled => write!(f, "Deduplication disabled"),
            Self::ForceReprocess => write!(f, "Force reprocess enabled"),
            Self::IdenticalExists { size } => {
                write!(f, "Identical content already produced ({size} bytes)")
            }
            Self::ExistingTooSmall { size, min_size } => write!(
                f,
                "Existing artifact too small ({size} bytes < {min_size}), reproducing"
            ),
            Self::ContentChanged { previous } => write!(
                f,
                "Content changed since last production ({previous} prior artifact(s))"
            ),
            Self::FirstProduction => write!(f, "No existing artifacts found"),
            Self::CheckFailed { error } => write!(f, "Collision check failed: {error}"),
        }
    }
}

/// Outcome of [`CollisionDetector::should_skip`].
#[derive(Debug, Clone, Serialize)]
pub struct SkipDecision {
    pub skip: bool,
    pub reason: SkipReason,
    /// Human-readable form of `reason`
    pub message: String,
    /// Fingerprint of the requested content, when computed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Deterministic artifact key, when computed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_key: Option<String>,
    /// Artifact found at `artifact_key`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_artifact: Option<ArtifactMetadata>,
    /// Artifacts for the same creator under other fingerprints
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub previous_artifacts: Vec<ArtifactMetadata>,
    pub content_changed: bool,
}

impl SkipDecision {
    fn new(skip: bool, reason: SkipReason) -> Self {
        Self {
            skip,
            message: reason.to_string(),
            reason,
            fingerprint: None,
            artifact_key: None,
            existing_artifact: None,
            previous_artifacts: Vec::new(),
            content_changed: false,
        }
    }

    fn produce(reason: SkipReason) -> Self {
        Self::new(false, reason)
    }
}

/// One check performed by [`CollisionDetector::validate_integrity`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IntegrityCheck {
    pub check: String,
    pub passed: bool,
    pub message: String,
    /// Advisory only; never fails validation
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub warning: bool,
}

impl IntegrityCheck {
    fn new(check: &str, passed: bool, message: String) -> Self {
        Self {
            check: check.to_string(),
            passed,
            message,
            warning: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityResult {
    pub key: String,
    pub valid: bool,
    pub checks: Vec<IntegrityCheck>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteFailure {
    pub key: String,
    pub error: String,
}

/// Result of [`CollisionDetector::cleanup_old`].
#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub creator: String,
    pub total_found: usize,
    pub kept: Vec<String>,
    pub deleted: Vec<String>,
    pub errors: Vec<DeleteFailure>,
}

/// Object metadata plus what the key says about it.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactDetails {
    #[serde(flatten)]
    pub metadata: ArtifactMetadata,
    pub location: String,
    pub creator_from_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SizeDistribution {
    /// Under 1 MiB
    pub small: usize,
    /// 1 to 10 MiB
    pub medium: usize,
    /// 10 MiB and above
    pub large: usize,
}

/// Aggregate view of stored artifacts under a prefix.
#[derive(Debug, Clone, Serialize)]
pub struct CollisionStatistics {
    pub search_prefix: String,
    pub total_artifacts: usize,
    pub unique_creators: usize,
    pub total_size_bytes: u64,
    pub average_size_bytes: f64,
    pub artifacts_per_creator: f64,
    pub size_distribution: SizeDistribution,
}

/// Decides whether a creator's artifact must be produced.
pub struct CollisionDetector {
    store: Arc<dyn ObjectStore>,
    fingerprinter: ContentFingerprinter,
    dedup: DedupConfig,
    retry: RetryPolicy,
    presigned_ttl: Duration,
}

impl CollisionDetector {
    /// Build a detector. Fails if the configured digest is unsupported.
    pub fn new(store: Arc<dyn ObjectStore>, config: &Config) -> Result<Self> {
        Ok(Self {
            store,
            fingerprinter: ContentFingerprinter::new(&config.dedup.hash_algorithm)?,
            dedup: config.dedup.clone(),
            retry: RetryPolicy::from_config(&config.retry),
            presigned_ttl: Duration::from_secs(config.storage.presigned_url_ttl_secs),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn fingerprinter(&self) -> &ContentFingerprinter {
        &self.fingerprinter
    }

    fn creator_prefix(creator: &str, output_prefix: &str) -> String {
        join_key(
            output_prefix,
            &format!("{COLLAGES_DIR}{}_collage_", sanitize_creator(creator)),
        )
    }

    /// Key for an already computed fingerprint.
    pub fn artifact_key_for(&self, creator: &str, fingerprint: &str, output_prefix: &str) -> String {
        let name = artifact_name(creator, fingerprint, &self.dedup.artifact_extension);
        join_key(output_prefix, &format!("{COLLAGES_DIR}{name}"))
    }

    /// Deterministic `{prefix}/collages/{name}` key for this content.
    pub fn artifact_key(
        &self,
        creator: &str,
        urls: &[String],
        output_prefix: &str,
        config: Option<&ProcessingConfig>,
    ) -> Result<String> {
        let fingerprint = self.fingerprinter.fingerprint(creator, urls, config)?;
        Ok(self.artifact_key_for(creator, &fingerprint, output_prefix))
    }

    /// Decide whether production can be skipped. Never fails.
    pub async fn should_skip(
        &self,
        creator: &str,
        urls: &[String],
        output_prefix: &str,
        config: Option<&ProcessingConfig>,
        force_reprocess: bool,
    ) -> SkipDecision {
        if !self.dedup.enabled {
            return SkipDecision::produce(SkipReason::DedupDisabled);
        }
        if force_reprocess || self.dedup.force_reprocess {
            return SkipDecision::produce(SkipReason::ForceReprocess);
        }

        let fingerprint = match self.fingerprinter.fingerprint(creator, urls, config) {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                log::warn!("Fingerprint failed for {}: {}", creator, e);
                return SkipDecision::produce(SkipReason::CheckFailed {
                    error: e.to_string(),
                });
            }
        };
        let key = self.artifact_key_for(creator, &fingerprint, output_prefix);

        let mut decision = match self.probe(creator, &key, output_prefix).await {
            Ok(decision) => decision,
            Err(e) => {
                log::warn!(
                    "Collision check for {} failed, proceeding with production: {}",
                    creator,
                    e
                );
                SkipDecision::produce(SkipReason::CheckFailed {
                    error: e.to_string(),
                })
            }
        };
        decision.fingerprint = Some(fingerprint);
        decision.artifact_key = Some(key);

        log::info!("{}: skip={} ({})", creator, decision.skip, decision.message);
        decision
    }

    async fn probe(&self, creator: &str, key: &str, output_prefix: &str) -> Result<SkipDecision> {
        let store = self.store.as_ref();
        let existing = self.retry.run("head artifact", move || store.head(key)).await?;

        if let Some(meta) = existing {
            let min_size = self.dedup.min_artifact_bytes;
            let mut decision = if meta.size >= min_size {
                SkipDecision::new(true, SkipReason::IdenticalExists { size: meta.size })
            } else {
                SkipDecision::produce(SkipReason::ExistingTooSmall {
                    size: meta.size,
                    min_size,
                })
            };
            decision.existing_artifact = Some(meta);
            return Ok(decision);
        }

        let previous = self.find_existing(creator, output_prefix).await?;
        if previous.is_empty() {
            return Ok(SkipDecision::produce(SkipReason::FirstProduction));
        }

        let mut decision = SkipDecision::produce(SkipReason::ContentChanged {
            previous: previous.len(),
        });
        decision.content_changed = true;
        decision.previous_artifacts = previous;
        Ok(decision)
    }

    /// Every stored artifact for a creator, newest first.
    pub async fn find_existing(
        &self,
        creator: &str,
        output_prefix: &str,
    ) -> Result<Vec<ArtifactMetadata>> {
        let prefix = Self::creator_prefix(creator, output_prefix);
        let store = self.store.as_ref();
        let prefix_ref = prefix.as_str();
        let mut found = self
            .retry
            .run("list artifacts", move || store.list(prefix_ref))
            .await?;
        found.sort_by(|a, b| {
            b.last_modified
                .cmp(&a.last_modified)
                .then_with(|| a.key.cmp(&b.key))
        });
        log::debug!("Found {} artifacts under {}", found.len(), prefix);
        Ok(found)
    }

    /// Size bounds and content type checks for a stored artifact.
    pub async fn validate_integrity(&self, key: &str) -> Result<IntegrityResult> {
        let Some(meta) = self.store.head(key).await? else {
            return Ok(IntegrityResult {
                key: key.to_string(),
                valid: false,
                checks: vec![IntegrityCheck::new(
                    "exists",
                    false,
                    "Artifact not found".to_string(),
                )],
            });
        };

        let mut checks = Vec::new();
        let (min, max) = (self.dedup.integrity_min_bytes, self.dedup.integrity_max_bytes);
        if meta.size < min {
            checks.push(IntegrityCheck::new(
                "minimum_size",
                false,
                format!("File too small: {} bytes (min: {})", meta.size, min),
            ));
        } else if meta.size > max {
            checks.push(IntegrityCheck::new(
                "maximum_size",
                false,
                format!("File too large: {} bytes (max: {})", meta.size, max),
            ));
        } else {
            checks.push(IntegrityCheck::new(
                "size",
                true,
                format!("File size OK: {} bytes", meta.size),
            ));
        }

        let content_type = meta.content_type.clone().unwrap_or_default();
        let type_ok = self
            .dedup
            .allowed_content_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&content_type));
        checks.push(IntegrityCheck::new(
            "content_type",
            type_ok,
            if type_ok {
                format!("Content type OK: {content_type}")
            } else {
                format!("Invalid content type: {content_type:?}")
            },
        ));

        let age_days = (Utc::now() - meta.last_modified).num_days();
        if age_days > self.dedup.integrity_max_age_days {
            checks.push(IntegrityCheck {
                warning: true,
                ..IntegrityCheck::new("age", true, format!("Artifact is {age_days} days old"))
            });
        }

        Ok(IntegrityResult {
            key: key.to_string(),
            valid: checks.iter().all(|c| c.passed),
            checks,
        })
    }

    /// Delete all but the `keep_latest` most recently modified artifacts.
    ///
    /// Individual delete failures are collected rather than aborting.
    pub async fn cleanup_old(
        &self,
        creator: &str,
        keep_latest: usize,
        output_prefix: &str,
    ) -> Result<CleanupReport> {
        let existing = self.find_existing(creator, output_prefix).await?;
        let total_found = existing.len();
        let split = keep_latest.min(total_found);
        let (keep, remove) = existing.split_at(split);

        let mut deleted = Vec::new();
        let mut errors = Vec::new();
        for meta in remove {
            match self.store.delete(&meta.key).await {
                Ok(()) => {
                    log::info!("Deleted old artifact {}", meta.key);
                    deleted.push(meta.key.clone());
                }
                Err(e) => {
                    log::error!("Failed to delete {}: {}", meta.key, e);
                    errors.push(DeleteFailure {
                        key: meta.key.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(CleanupReport {
            creator: creator.to_string(),
            total_found,
            kept: keep.iter().map(|m| m.key.clone()).collect(),
            deleted,
            errors,
        })
    }

    pub async fn artifact_metadata(&self, key: &str) -> Result<Option<ArtifactDetails>> {
        Ok(self.store.head(key).await?.map(|metadata| ArtifactDetails {
            location: join_key(&self.store.location(), &metadata.key),
            creator_from_key: metadata.creator_from_key().map(str::to_string),
            metadata,
        }))
    }

    /// Count, size and per-creator figures for every artifact under a prefix.
    pub async fn collision_statistics(&self, output_prefix: &str) -> Result<CollisionStatistics> {
        let search_prefix = join_key(output_prefix, COLLAGES_DIR);
        let objects = self.store.list(&search_prefix).await?;

        let mut creators = BTreeSet::new();
        let mut distribution = SizeDistribution::default();
        let mut total_size_bytes = 0;
        for meta in &objects {
            total_size_bytes += meta.size;
            if let Some(creator) = meta.creator_from_key() {
                creators.insert(creator.to_string());
            }
            match meta.size {
                s if s < MIB => distribution.small += 1,
                s if s < 10 * MIB => distribution.medium += 1,
                _ => distribution.large += 1,
            }
        }

        let total = objects.len();
        Ok(CollisionStatistics {
            search_prefix,
            total_artifacts: total,
            unique_creators: creators.len(),
            total_size_bytes,
            average_size_bytes: if total > 0 {
                total_size_bytes as f64 / total as f64
            } else {
                0.0
            },
            artifacts_per_creator: if creators.is_empty() {
                0.0
            } else {
                total as f64 / creators.len() as f64
            },
            size_distribution: distribution,
        })
    }

    /// Download link valid for the configured TTL.
    pub async fn presigned_url(&self, key: &str) -> Result<String> {
        self.store.presigned_url(key, self.presigned_ttl).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::storage::MemoryObjectStore;

    fn urls(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn setup() -> (Arc<MemoryObjectStore>, CollisionDetector) {
        let store = Arc::new(MemoryObjectStore::new());
        let detector = CollisionDetector::new(store.clone(), &Config::default())
            .unwrap()
            .with_retry(RetryPolicy::none());
        (store, detector)
    }

    #[test]
    fn test_unsupported_algorithm_rejected() {
        let mut config = Config::default();
        config.dedup.hash_algorithm = "md5".into();
        let store = Arc::new(MemoryObjectStore::new());
        assert!(CollisionDetector::new(store, &config).is_err());
    }

    #[test]
    fn test_artifact_key_layout() {
        let (_, detector) = setup();
        let key = detector
            .artifact_key("Jane Doe", &urls(&["http://a/1.jpg"]), "out/", None)
            .unwrap();
        assert!(key.starts_with("out/collages/jane_doe_collage_"));
        assert!(key.ends_with(".jpg"));
        let hash = key
            .trim_start_matches("out/collages/jane_doe_collage_")
            .trim_end_matches(".jpg");
        assert_eq!(hash.len(), 12);

        let bare = detector
            .artifact_key("Jane Doe", &urls(&["http://a/1.jpg"]), "", None)
            .unwrap();
        assert!(bare.starts_with("collages/"));
    }

    #[tokio::test]
    async fn test_skip_when_identical_artifact_exists() {
        let (store, detector) = setup();
        let list = urls(&["http://a/1.jpg", "http://a/2.jpg"]);
        let config = ProcessingConfig::default();
        let key = detector.artifact_key("Jane Doe", &list, "out", Some(&config)).unwrap();
        store.put(&key, vec![0; 150 * 1024], "image/jpeg").await.unwrap();

        let decision = detector
            .should_skip("Jane Doe", &list, "out", Some(&config), false)
            .await;
        assert!(decision.skip);
        assert!(matches!(decision.reason, SkipReason::IdenticalExists { .. }));
        assert_eq!(decision.artifact_key.as_deref(), Some(key.as_str()));

        let mut changed = list.clone();
        changed.push("http://a/3.jpg".into());
        let decision = detector
            .should_skip("Jane Doe", &changed, "out", Some(&config), false)
            .await;
        assert!(!decision.skip);
        assert!(decision.content_changed);
        assert_eq!(decision.previous_artifacts.len(), 1);
    }

    #[tokio::test]
    async fn test_undersized_artifact_is_reproduced() {
        let (store, detector) = setup();
        let list = urls(&["http://a/1.jpg"]);
        let key = detector.artifact_key("jane", &list, "out", None).unwrap();
        store.put(&key, vec![0; 10], "image/jpeg").await.unwrap();

        let decision = detector.should_skip("jane", &list, "out", None, false).await;
        assert!(!decision.skip);
        assert!(matches!(decision.reason, SkipReason::ExistingTooSmall { size: 10, .. }));
    }

    #[tokio::test]
    async fn test_first_production_and_overrides() {
        let (store, detector) = setup();
        let list = urls(&["http://a/1.jpg"]);
        let decision = detector.should_skip("new", &list, "out", None, false).await;
        assert!(!decision.skip);
        assert_eq!(decision.reason, SkipReason::FirstProduction);

        let key = detector.artifact_key("new", &list, "out", None).unwrap();
        store.put(&key, vec![0; 200 * 1024], "image/jpeg").await.unwrap();
        let forced = detector.should_skip("new", &list, "out", None, true).await;
        assert!(!forced.skip);
        assert_eq!(forced.reason, SkipReason::ForceReprocess);
    }

    #[tokio::test]
    async fn test_dedup_disabled_never_skips() {
        let mut config = Config::default();
        config.dedup.enabled = false;
        let store = Arc::new(MemoryObjectStore::new());
        let detector = CollisionDetector::new(store, &config).unwrap();
        let decision = detector.should_skip("a", &urls(&["u"]), "", None, false).await;
        assert!(!decision.skip);
        assert_eq!(decision.reason, SkipReason::DedupDisabled);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let (store, detector) = setup();
        let list = urls(&["http://a/1.jpg"]);
        let key = detector.artifact_key("jane", &list, "out", None).unwrap();
        store.put(&key, vec![0; 200 * 1024], "image/jpeg").await.unwrap();
        store.set_unavailable(true);

        let decision = detector.should_skip("jane", &list, "out", None, false).await;
        assert!(!decision.skip);
        assert!(matches!(decision.reason, SkipReason::CheckFailed { .. }));
        assert!(decision.message.starts_with("Collision check failed"));
    }

    #[tokio::test]
    async fn test_find_existing_does_not_match_longer_names() {
        let (store, detector) = setup();
        store.put("out/collages/jane_collage_aaa.jpg", vec![1], "image/jpeg").await.unwrap();
        store.put("out/collages/jane_doe_collage_bbb.jpg", vec![1], "image/jpeg").await.unwrap();
        let found = detector.find_existing("Jane", "out").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key, "out/collages/jane_collage_aaa.jpg");
    }

    #[tokio::test]
    async fn test_cleanup_keeps_newest() {
        let (store, detector) = setup();
        let now = Utc::now();
        for (i, age) in [3i64, 1, 2].iter().enumerate() {
            store
                .put_at(
                    &format!("out/collages/jane_collage_{i}.jpg"),
                    vec![0; 4],
                    "image/jpeg",
                    now - ChronoDuration::hours(*age),
                )
                .await;
        }

        let report = detector.cleanup_old("jane", 1, "out").await.unwrap();
        assert_eq!(report.total_found, 3);
        assert_eq!(report.kept, vec!["out/collages/jane_collage_1.jpg"]);
        assert_eq!(report.deleted.len(), 2);
        assert!(report.errors.is_empty());
        assert!(store.contains("out/collages/jane_collage_1.jpg").await);
        assert!(!store.contains("out/collages/jane_collage_0.jpg").await);

        let none = detector.cleanup_old("jane", 5, "out").await.unwrap();
        assert!(none.deleted.is_empty());
    }

    #[tokio::test]
    async fn test_validate_integrity() {
        let (store, detector) = setup();
        store.put("ok.jpg", vec![0; 60 * 1024], "image/jpeg").await.unwrap();
        store.put("small.jpg", vec![0; 10], "image/jpeg").await.unwrap();
        store.put("wrong.jpg", vec![0; 60 * 1024], "image/png").await.unwrap();
        store
            .put_at(
                "old.jpg",
                vec![0; 60 * 1024],
                "image/jpeg",
                Utc::now() - ChronoDuration::days(45),
            )
            .await;

        assert!(detector.validate_integrity("ok.jpg").await.unwrap().valid);
        assert!(!detector.validate_integrity("small.jpg").await.unwrap().valid);
        assert!(!detector.validate_integrity("wrong.jpg").await.unwrap().valid);
        assert!(!detector.validate_integrity("missing.jpg").await.unwrap().valid);

        let old = detector.validate_integrity("old.jpg").await.unwrap();
        assert!(old.valid);
        assert!(old.checks.iter().any(|c| c.warning));
    }

    #[tokio::test]
    async fn test_collision_statistics() {
        let (store, detector) = setup();
        store.put("out/collages/a_collage_1.jpg", vec![0; 10], "image/jpeg").await.unwrap();
        store.put("out/collages/a_collage_2.jpg", vec![0; 30], "image/jpeg").await.unwrap();
        store.put("out/collages/b_collage_3.jpg", vec![0; 20], "image/jpeg").await.unwrap();

        let stats = detector.collision_statistics("out").await.unwrap();
        assert_eq!(stats.total_artifacts, 3);
        assert_eq!(stats.unique_creators, 2);
        assert_eq!(stats.total_size_bytes, 60);
        assert!((stats.average_size_bytes - 20.0).abs() < f64::EPSILON);
        assert!((stats.artifacts_per_creator - 1.5).abs() < f64::EPSILON);
        assert_eq!(stats.size_distribution.small, 3);

        let details = detector
            .artifact_metadata("out/collages/b_collage_3.jpg")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(details.creator_from_key.as_deref(), Some("b"));
    }
}
