// src/services/scheduler.rs

//! Per-creator orchestration.
//!
//! For every creator in a batch:
//! 1. Fingerprint the content and probe for an identical artifact
//! 2. Consult the processing history
//! 3. Claim (creator, day) with a conditional insert
//! 4. Render, then record the terminal status
//!
//! Creators run concurrently up to `processing.max_workers`.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::error::Result;
use crate::models::{AttemptId, Batch, Creator, ProcessingConfig, StatusUpdate, processing_day};
use crate::services::{CollisionDetector, ProcessingStateStore};

/// Produces and stores the artifact for one creator.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Compose `urls` into an artifact written at `artifact_key`.
    async fn render(
        &self,
        creator: &str,
        urls: &[String],
        artifact_key: &str,
        config: &ProcessingConfig,
    ) -> Result<RenderReport>;
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RenderReport {
    /// Images that made it into the artifact
    pub images_used: usize,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    Skipped,
    Produced,
    /// Another worker owns this creator today
    Conflict,
    Failed,
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Skipped => "skipped",
            Self::Produced => "produced",
            Self::Conflict => "conflict",
            Self::Failed => "failed",
        })
    }
}

/// What happened to one creator, with a readable reason.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub creator: String,
    pub action: JobAction,
    pub reason: String,
    pub artifact_key: Option<String>,
    pub fingerprint: Option<String>,
    pub duration_ms: u64,
}

impl JobOutcome {
    fn new(creator: &str, action: JobAction, reason: impl Into<String>) -> Self {
        Self {
            creator: creator.to_string(),
            action,
            reason: reason.into(),
            artifact_key: None,
            fingerprint: None,
            duration_ms: 0,
        }
    }

    fn with_artifact(mut self, fingerprint: &str, artifact_key: &str) -> Self {
        self.fingerprint = Some(fingerprint.to_string());
        self.artifact_key = Some(artifact_key.to_string());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    pub batch_id: String,
    pub produced: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub failed: usize,
    pub jobs: Vec<JobOutcome>,
}

impl BatchOutcome {
    fn record(&mut self, job: JobOutcome) {
        match job.action {
            JobAction::Produced => self.produced += 1,
            JobAction::Skipped => self.skipped += 1,
            JobAction::Conflict => self.conflicts += 1,
            JobAction::Failed => self.failed += 1,
        }
        self.jobs.push(job);
    }
}

/// Runs creators through detection, claiming and rendering.
pub struct CreatorScheduler {
    detector: Arc<CollisionDetector>,
    state: Arc<ProcessingStateStore>,
    renderer: Arc<dyn Renderer>,
    output_prefix: String,
    force_reprocess: bool,
}

impl CreatorScheduler {
    pub fn new(
        detector: Arc<CollisionDetector>,
        state: Arc<ProcessingStateStore>,
        renderer: Arc<dyn Renderer>,
        output_prefix: impl Into<String>,
    ) -> Self {
        Self {
            detector,
            state,
            renderer,
            output_prefix: output_prefix.into(),
            force_reprocess: false,
        }
    }

    pub fn with_force_reprocess(mut self, force: bool) -> Self {
        self.force_reprocess = force;
        self
    }

    /// Process every creator of a batch with bounded concurrency.
    pub async fn run_batch(
        &self,
        batch: &Batch,
        batch_id: &str,
        config: &ProcessingConfig,
    ) -> BatchOutcome {
        let workers = config.max_workers.max(1);
        log::info!(
            "Batch {}: {} creators, {} URLs, {} workers",
            batch_id,
            batch.creator_count(),
            batch.size(),
            workers
        );

        let mut outcome = BatchOutcome {
            batch_id: batch_id.to_string(),
            ..BatchOutcome::default()
        };
        let mut jobs = stream::iter(batch.creators.iter())
            .map(|(name, urls)| async move {
                let creator = Creator::new(name.clone(), urls.clone());
                self.run_job(&creator, batch_id, config).await
            })
            .buffer_unordered(workers);

        while let Some(job) = jobs.next().await {
            outcome.record(job);
        }
        outcome.jobs.sort_by(|a, b| a.creator.cmp(&b.creator));

        log::info!(
            "Batch {} done: {} produced, {} skipped, {} conflicts, {} failed",
            batch_id,
            outcome.produced,
            outcome.skipped,
            outcome.conflicts,
            outcome.failed
        );
        outcome
    }

    /// Process one creator.
    pub async fn run_job(
        &self,
        creator: &Creator,
        batch_id: &str,
        config: &ProcessingConfig,
    ) -> JobOutcome {
        self.run_job_at(creator, batch_id, config, Utc::now()).await
    }

    pub async fn run_job_at(
        &self,
        creator: &Creator,
        batch_id: &str,
        config: &ProcessingConfig,
        now: DateTime<Utc>,
    ) -> JobOutcome {
        let name = creator.name.as_str();
        let hash_urls = creator.hash_urls();
        if hash_urls.is_empty() {
            return JobOutcome::new(name, JobAction::Skipped, "No content URLs");
        }

        let decision = self
            .detector
            .should_skip(
                name,
                &hash_urls,
                &self.output_prefix,
                Some(config),
                self.force_reprocess,
            )
            .await;

        let fingerprint = match decision.fingerprint.clone() {
            Some(fingerprint) => fingerprint,
            None => match self
                .detector
                .fingerprinter()
                .fingerprint(name, &hash_urls, Some(config))
            {
                Ok(fingerprint) => fingerprint,
                Err(e) => return JobOutcome::new(name, JobAction::Failed, e.to_string()),
            },
        };
        let artifact_key = decision.artifact_key.clone().unwrap_or_else(|| {
            self.detector
                .artifact_key_for(name, &fingerprint, &self.output_prefix)
        });

        if decision.skip {
            return JobOutcome::new(name, JobAction::Skipped, decision.message)
                .with_artifact(&fingerprint, &artifact_key);
        }

        if !self.force_reprocess {
            match self
                .state
                .check_processed_at(name, Some(&fingerprint), None, now)
                .await
            {
                Ok(state) if state.processed => {
                    return JobOutcome::new(name, JobAction::Skipped, state.message)
                        .with_artifact(&fingerprint, &artifact_key);
                }
                Ok(state) if state.stale => {
                    if let Some(latest) = &state.latest {
                        log::warn!("Reclaiming stale processing record for {}", name);
                        let message = "Reclaimed after exceeding the staleness window";
                        match self.state.reclaim_stale(latest, message).await {
                            Ok(true) => {}
                            Ok(false) => {
                                return JobOutcome::new(
                                    name,
                                    JobAction::Conflict,
                                    "Stale record was reclaimed by another worker",
                                )
                                .with_artifact(&fingerprint, &artifact_key);
                            }
                            // The row is still processing, so the claim below fails
                            Err(e) => log::warn!("Could not reclaim {}: {}", name, e),
                        }
                    }
                }
                Ok(_) => {}
                // The conditional insert below still arbitrates ownership
                Err(e) => log::warn!("State check for {} failed: {}", name, e),
            }
        }

        let image_count = hash_urls.len();
        match self
            .state
            .create_record_at(name, batch_id, &fingerprint, image_count, config, now)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                return JobOutcome::new(
                    name,
                    JobAction::Conflict,
                    "Already being processed by another worker",
                )
                .with_artifact(&fingerprint, &artifact_key);
            }
            Err(e) => {
                log::error!("Could not claim {}: {}", name, e);
                return JobOutcome::new(name, JobAction::Failed, e.to_string())
                    .with_artifact(&fingerprint, &artifact_key);
            }
        }

        let day = processing_day(now);
        let attempt = AttemptId::new(batch_id, now);
        let mut render_urls = creator.render_urls();
        render_urls.truncate(config.max_images_per_creator);

        let started = Instant::now();
        let rendered = self
            .renderer
            .render(name, &render_urls, &artifact_key, config)
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut outcome = match rendered {
            Ok(report) => {
                let update =
                    StatusUpdate::completed(&artifact_key, duration_ms).for_attempt(attempt);
                match self.state.update_status(name, day, &update).await {
                    Ok(_) => JobOutcome::new(
                        name,
                        JobAction::Produced,
                        format!("Rendered {} images", report.images_used),
                    ),
                    Err(e) => {
                        log::error!("Rendered {} but could not record completion: {}", name, e);
                        JobOutcome::new(
                            name,
                            JobAction::Failed,
                            format!("Completion not recorded: {e}"),
                        )
                    }
                }
            }
            Err(e) => {
                log::error!("Render failed for {}: {}", name, e);
                let update = StatusUpdate::failed(e.to_string())
                    .with_duration(duration_ms)
                    .for_attempt(attempt);
                self.state.mark_failed_best_effort(name, day, &update).await;
                JobOutcome::new(name, JobAction::Failed, e.to_string())
            }
        };
        outcome.duration_ms = duration_ms;
        outcome.with_artifact(&fingerprint, &artifact_key)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Duration;

    use super::*;
    use crate::error::AppError;
    use crate::models::{Config, ProcessingRecord, ProcessingStatus};
    use crate::pipeline::RetryPolicy;
    use crate::storage::{MemoryObjectStore, MemoryRecordTable, ObjectStore, RecordTable};

    struct FakeRenderer {
        store: Arc<MemoryObjectStore>,
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Renderer for FakeRenderer {
        async fn render(
            &self,
            _creator: &str,
            urls: &[String],
            artifact_key: &str,
            _config: &ProcessingConfig,
        ) -> Result<RenderReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AppError::store("download failed"));
            }
            let bytes = vec![0; 200 * 1024];
            self.store.put(artifact_key, bytes, "image/jpeg").await?;
            Ok(RenderReport {
                images_used: urls.len(),
                bytes_written: 200 * 1024,
            })
        }
    }

    struct Harness {
        table: Arc<MemoryRecordTable>,
        renderer: Arc<FakeRenderer>,
        scheduler: CreatorScheduler,
    }

    fn harness(fail: bool) -> Harness {
        let config = Config::default();
        let store = Arc::new(MemoryObjectStore::new());
        let table = Arc::new(MemoryRecordTable::new());
        let detector = CollisionDetector::new(store.clone(), &config)
            .unwrap()
            .with_retry(RetryPolicy::none());
        let state = ProcessingStateStore::new(table.clone(), config.state.clone())
            .with_retry(RetryPolicy::none());
        let renderer = Arc::new(FakeRenderer {
            store,
            calls: AtomicUsize::new(0),
            fail,
        });
        let scheduler = CreatorScheduler::new(
            Arc::new(detector),
            Arc::new(state),
            renderer.clone(),
            "out",
        );
        Harness {
            table,
            renderer,
            scheduler,
        }
    }

    fn creator(name: &str, n: usize) -> Creator {
        Creator::new(name, (0..n).map(|i| format!("http://a/{i}.jpg")).collect())
    }

    #[tokio::test]
    async fn test_produce_then_skip() {
        let h = harness(false);
        let config = ProcessingConfig::default();

        let first = h.scheduler.run_job(&creator("Jane", 3), "run-0000", &config).await;
        assert_eq!(first.action, JobAction::Produced);
        assert!(first.artifact_key.as_deref().unwrap().starts_with("out/collages/jane_collage_"));

        let second = h.scheduler.run_job(&creator("Jane", 3), "run-0001", &config).await;
        assert_eq!(second.action, JobAction::Skipped);
        assert_eq!(h.renderer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_in_flight_record_blocks_second_worker() {
        let h = harness(false);
        let config = ProcessingConfig::default();
        let now = Utc::now();
        let fingerprint = h
            .scheduler
            .detector
            .fingerprinter()
            .fingerprint("jane", &creator("jane", 2).hash_urls(), Some(&config))
            .unwrap();
        h.table
            .seed(ProcessingRecord::started(
                "jane",
                "run-other",
                &fingerprint,
                2,
                "{}".into(),
                now,
                Duration::days(30),
            ))
            .await;

        let outcome = h
            .scheduler
            .run_job_at(&creator("jane", 2), "run-0000", &config, now)
            .await;
        assert_eq!(outcome.action, JobAction::Skipped);
        assert_eq!(outcome.reason, "Currently being processed");
        assert_eq!(h.renderer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_render_failure_marks_record_failed() {
        let h = harness(true);
        let config = ProcessingConfig::default();
        let outcome = h.scheduler.run_job(&creator("jane", 2), "run-0000", &config).await;
        assert_eq!(outcome.action, JobAction::Failed);

        let rows = h.table.query_creator("jane", 1).await.unwrap();
        assert_eq!(rows[0].status, ProcessingStatus::Failed);
        assert!(rows[0].error_message.as_deref().unwrap().contains("download failed"));
        assert!(rows[0].duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_stale_record_is_reclaimed_inline() {
        let h = harness(false);
        let config = ProcessingConfig::default();
        let noon = Utc::now().date_naive().and_hms_opt(12, 0, 0).unwrap().and_utc();
        let fingerprint = h
            .scheduler
            .detector
            .fingerprinter()
            .fingerprint("jane", &creator("jane", 2).hash_urls(), Some(&config))
            .unwrap();
        h.table
            .seed(ProcessingRecord::started(
                "jane",
                "run-crashed",
                &fingerprint,
                2,
                "{}".into(),
                noon - Duration::minutes(40),
                Duration::days(30),
            ))
            .await;

        let outcome = h
            .scheduler
            .run_job_at(&creator("jane", 2), "run-0000", &config, noon)
            .await;
        assert_eq!(outcome.action, JobAction::Produced);
        assert_eq!(h.renderer.calls.load(Ordering::SeqCst), 1);

        let rows = h.table.query_creator("jane", 1).await.unwrap();
        assert_eq!(rows[0].status, ProcessingStatus::Completed);
        assert_eq!(rows[0].batch_id, "run-0000");
        assert_eq!(rows[0].created_at, noon);
    }

    #[tokio::test]
    async fn test_completion_is_dropped_after_losing_the_row() {
        let h = harness(false);
        let config = ProcessingConfig::default();
        let noon = Utc::now().date_naive().and_hms_opt(12, 0, 0).unwrap().and_utc();
        assert!(
            h.scheduler
                .state
                .create_record_at("jane", "run-0000", "h", 2, &config, noon)
                .await
                .unwrap()
        );
        let ours = h.table.query_creator("jane", 1).await.unwrap().remove(0);

        // Another worker times the attempt out and claims the slot
        assert!(h.scheduler.state.reclaim_stale(&ours, "timed out").await.unwrap());
        assert!(
            h.scheduler
                .state
                .create_record_at("jane", "run-0001", "h", 2, &config, noon)
                .await
                .unwrap()
        );

        let late = StatusUpdate::completed("out/collages/x.jpg", 1).for_attempt(ours.attempt());
        let err = h
            .scheduler
            .state
            .update_status("jane", ours.processing_date, &late)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        let row = h.table.query_creator("jane", 1).await.unwrap().remove(0);
        assert_eq!(row.status, ProcessingStatus::Processing);
        assert_eq!(row.batch_id, "run-0001");
    }

    #[tokio::test]
    async fn test_run_batch_counts_and_truncates() {
        let h = harness(false);
        let config = ProcessingConfig {
            max_images_per_creator: 2,
            max_workers: 2,
            ..ProcessingConfig::default()
        };
        let mut batch = Batch::new(0);
        batch.creators.insert("a".into(), creator("a", 5).urls);
        batch.creators.insert("b".into(), creator("b", 1).urls);
        batch.creators.insert("empty".into(), vec!["  ".into()]);

        let outcome = h.scheduler.run_batch(&batch, "run-0000", &config).await;
        assert_eq!(outcome.produced, 2);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.jobs.len(), 3);
        assert_eq!(outcome.jobs[0].reason, "Rendered 2 images");
    }
}
