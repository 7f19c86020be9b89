// src/services/state.rs

//! Idempotent per-creator processing state.
//!
//! One record per (creator, day). The table's conditional insert is the only
//! arbiter of ownership: [`ProcessingStateStore::check_processed`] is advisory
//! and may race with other workers, [`ProcessingStateStore::create_record`]
//! never does. Updates made on behalf of a specific attempt carry its
//! [`AttemptId`](crate::models::AttemptId) and lose to any newer claim on the
//! same row.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::models::{
    ProcessingConfig, ProcessingRecord, ProcessingStatus, RecordKey, StateConfig, StatusUpdate,
    normalize_creator, processing_day,
};
use crate::pipeline::RetryPolicy;
use crate::storage::RecordTable;
use crate::utils::to_canonical_json;

/// Which rule produced a [`ProcessedDecision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessedReason {
    NoRecords,
    SameContentCompleted,
    ContentChanged,
    CompletedToday,
    InFlight,
    Stale,
    PreviousIncomplete,
}

impl fmt::Display for ProcessedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoRecords => "No processing records found",
            Self::SameContentCompleted => "Same content already processed successfully",
            Self::ContentChanged => "Content has changed since last processing",
            Self::CompletedToday => "Already processed successfully today",
            Self::InFlight => "Currently being processed",
            Self::Stale => "Previous processing appears stale",
            Self::PreviousIncomplete => "Previous processing failed or incomplete",
        })
    }
}

/// Whether a creator needs production, and why.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedDecision {
    pub processed: bool,
    pub reason: ProcessedReason,
    pub message: String,
    pub content_changed: bool,
    /// Latest record is `processing` and past the staleness window
    pub stale: bool,
    pub latest: Option<ProcessingRecord>,
}

impl ProcessedDecision {
    fn new(processed: bool, reason: ProcessedReason, latest: Option<ProcessingRecord>) -> Self {
        Self {
            processed,
            message: reason.to_string(),
            content_changed: reason == ProcessedReason::ContentChanged,
            stale: reason == ProcessedReason::Stale,
            reason,
            latest,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatorStatus {
    pub creator: String,
    pub status: ProcessingStatus,
    pub processing_date: NaiveDate,
    pub image_count: usize,
    pub artifact_key: Option<String>,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
}

/// Aggregate progress of one batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchStatus {
    pub batch_id: String,
    pub total_creators: usize,
    pub status_counts: BTreeMap<ProcessingStatus, usize>,
    pub completion_percentage: f64,
    pub creators: Vec<CreatorStatus>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DailyStatistics {
    pub creators: usize,
    pub images: usize,
    pub duration_ms: u64,
}

/// Completed work over a trailing window of days.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingStatistics {
    pub period_days: i64,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub total_creators_processed: usize,
    pub total_images_processed: usize,
    pub total_duration_ms: u64,
    pub average_images_per_creator: f64,
    pub average_duration_per_creator_ms: f64,
    pub daily_statistics: BTreeMap<NaiveDate, DailyStatistics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub table_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Processing state over a [`RecordTable`].
pub struct ProcessingStateStore {
    table: Arc<dyn RecordTable>,
    config: StateConfig,
    retry: RetryPolicy,
    request_id: Option<String>,
}

impl ProcessingStateStore {
    pub fn new(table: Arc<dyn RecordTable>, config: StateConfig) -> Self {
        Self {
            table,
            config,
            retry: RetryPolicy::default(),
            request_id: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Stamp records created by this store with the invoking request.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    fn stale_window(&self) -> Duration {
        Duration::minutes(self.config.stale_after_minutes)
    }

    /// Most recent non-expired records, newest first.
    async fn recent(
        &self,
        creator: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProcessingRecord>> {
        let table = self.table.as_ref();
        let rows = self
            .retry
            .run("query creator", move || table.query_creator(creator, limit))
            .await?;
        Ok(rows.into_iter().filter(|r| !r.is_expired(now)).collect())
    }

    /// Decide whether a creator was already processed.
    pub async fn check_processed(
        &self,
        creator: &str,
        fingerprint: Option<&str>,
        day: Option<NaiveDate>,
    ) -> Result<ProcessedDecision> {
        self.check_processed_at(creator, fingerprint, day, Utc::now())
            .await
    }

    pub async fn check_processed_at(
        &self,
        creator: &str,
        fingerprint: Option<&str>,
        day: Option<NaiveDate>,
        now: DateTime<Utc>,
    ) -> Result<ProcessedDecision> {
        let day = day.unwrap_or_else(|| processing_day(now));
        let mut rows = self.recent(creator, self.config.history_limit, now).await?;
        if rows.is_empty() {
            return Ok(ProcessedDecision::new(false, ProcessedReason::NoRecords, None));
        }
        let latest = rows.swap_remove(0);

        if let Some(fingerprint) = fingerprint.filter(|f| !f.is_empty())
            && !latest.content_hash.is_empty()
        {
            if latest.content_hash != fingerprint {
                return Ok(ProcessedDecision::new(
                    false,
                    ProcessedReason::ContentChanged,
                    Some(latest),
                ));
            }
            if latest.status == ProcessingStatus::Completed {
                return Ok(ProcessedDecision::new(
                    true,
                    ProcessedReason::SameContentCompleted,
                    Some(latest),
                ));
            }
        }

        let (processed, reason) = match latest.status {
            ProcessingStatus::Completed if latest.processing_date == day => {
                (true, ProcessedReason::CompletedToday)
            }
            ProcessingStatus::Processing if latest.age(now) > self.stale_window() => {
                (false, ProcessedReason::Stale)
            }
            ProcessingStatus::Processing => (true, ProcessedReason::InFlight),
            _ => (false, ProcessedReason::PreviousIncomplete),
        };
        log::debug!("{}: processed={} ({})", creator, processed, reason);
        Ok(ProcessedDecision::new(processed, reason, Some(latest)))
    }

    /// Claim (creator, today). `false` means another worker owns it.
    pub async fn create_record(
        &self,
        creator: &str,
        batch_id: &str,
        fingerprint: &str,
        image_count: usize,
        config: &ProcessingConfig,
    ) -> Result<bool> {
        self.create_record_at(creator, batch_id, fingerprint, image_count, config, Utc::now())
            .await
    }

    pub async fn create_record_at(
        &self,
        creator: &str,
        batch_id: &str,
        fingerprint: &str,
        image_count: usize,
        config: &ProcessingConfig,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut record = ProcessingRecord::started(
            creator,
            batch_id,
            fingerprint,
            image_count,
            to_canonical_json(config)?,
            now,
            Duration::days(self.config.retention_days),
        );
        record.request_id = self.request_id.clone();

        let table = self.table.as_ref();
        let row = &record;
        let inserted = self
            .retry
            .run("insert record", move || table.insert_if_idle(row))
            .await?;
        if inserted {
            log::info!("Created processing record {}", record.key());
            return Ok(true);
        }

        // A retried insert may have landed on an earlier attempt
        let existing = self.table.get(&record.key()).await?;
        let ours = existing
            .is_some_and(|e| e.created_at == record.created_at && e.batch_id == record.batch_id);
        if ours {
            log::debug!("Record {} already written by an earlier attempt", record.key());
        } else {
            log::info!("{} is already being processed elsewhere", record.key());
        }
        Ok(ours)
    }

    /// Move a record to a terminal status.
    pub async fn update_status(
        &self,
        creator: &str,
        day: NaiveDate,
        update: &StatusUpdate,
    ) -> Result<ProcessingRecord> {
        let key = RecordKey::new(creator, day);
        let table = self.table.as_ref();
        let key_ref = &key;
        let updated = self
            .retry
            .run("update record", move || {
                table.update(key_ref, update, Utc::now())
            })
            .await?;
        log::info!("Updated {} to {}", key, updated.status);
        Ok(updated)
    }

    /// Failure-path update whose errors are logged and dropped.
    pub async fn mark_failed_best_effort(
        &self,
        creator: &str,
        day: NaiveDate,
        update: &StatusUpdate,
    ) {
        if let Err(e) = self.update_status(creator, day, update).await {
            log::warn!(
                "Could not mark {}@{} failed: {}",
                normalize_creator(creator),
                day,
                e
            );
        }
    }

    /// Fail a stale in-flight record so a new attempt can claim the slot.
    ///
    /// Returns `false` when the row no longer belongs to `stale`: another
    /// worker reclaimed or finished it first.
    pub async fn reclaim_stale(&self, stale: &ProcessingRecord, message: &str) -> Result<bool> {
        let update = StatusUpdate::failed(message).for_attempt(stale.attempt());
        match self
            .update_status(&stale.creator, stale.processing_date, &update)
            .await
        {
            Ok(_) => Ok(true),
            Err(e @ AppError::Conflict(_)) => {
                log::info!("Stale record {} already reclaimed: {}", stale.key(), e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Per-status counts and completion for one batch.
    pub async fn batch_status(&self, batch_id: &str) -> Result<BatchStatus> {
        let table = self.table.as_ref();
        let now = Utc::now();
        let rows: Vec<ProcessingRecord> = self
            .retry
            .run("query batch", move || table.query_batch(batch_id))
            .await?
            .into_iter()
            .filter(|r| !r.is_expired(now))
            .collect();

        let mut status_counts = BTreeMap::new();
        for row in &rows {
            *status_counts.entry(row.status).or_insert(0) += 1;
        }
        let total = rows.len();
        let completed = status_counts
            .get(&ProcessingStatus::Completed)
            .copied()
            .unwrap_or(0);

        Ok(BatchStatus {
            batch_id: batch_id.to_string(),
            total_creators: total,
            status_counts,
            completion_percentage: if total > 0 {
                completed as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            creators: rows
                .into_iter()
                .map(|r| CreatorStatus {
                    creator: r.creator,
                    status: r.status,
                    processing_date: r.processing_date,
                    image_count: r.image_count,
                    artifact_key: r.artifact_key,
                    duration_ms: r.duration_ms,
                    error_message: r.error_message,
                })
                .collect(),
        })
    }

    /// Completed records over the last `days` days.
    pub async fn statistics(&self, days: i64) -> Result<ProcessingStatistics> {
        let now = Utc::now();
        let end_date = processing_day(now);
        let start_date = processing_day(now - Duration::days(days));
        let table = self.table.as_ref();
        let rows: Vec<ProcessingRecord> = self
            .retry
            .run("query completed", move || {
                table.query_status(ProcessingStatus::Completed, start_date, end_date)
            })
            .await?
            .into_iter()
            .filter(|r| !r.is_expired(now))
            .collect();

        let mut daily_statistics: BTreeMap<NaiveDate, DailyStatistics> = BTreeMap::new();
        for row in &rows {
            let day = daily_statistics.entry(row.processing_date).or_default();
            day.creators += 1;
            day.images += row.image_count;
            day.duration_ms += row.duration_ms.unwrap_or(0);
        }
        let total_creators_processed = rows.len();
        let total_images_processed: usize = daily_statistics.values().map(|d| d.images).sum();
        let total_duration_ms: u64 = daily_statistics.values().map(|d| d.duration_ms).sum();
        let average = |sum: f64| {
            if total_creators_processed > 0 {
                (sum / total_creators_processed as f64 * 100.0).round() / 100.0
            } else {
                0.0
            }
        };

        Ok(ProcessingStatistics {
            period_days: days,
            start_date,
            end_date,
            total_creators_processed,
            total_images_processed,
            total_duration_ms,
            average_images_per_creator: average(total_images_processed as f64),
            average_duration_per_creator_ms: average(total_duration_ms as f64),
            daily_statistics,
        })
    }

    /// Force `processing` rows older than `max_age_minutes` to `failed`.
    pub async fn cleanup_stale(&self, max_age_minutes: i64) -> Result<usize> {
        self.cleanup_stale_at(max_age_minutes, Utc::now()).await
    }

    pub async fn cleanup_stale_at(
        &self,
        max_age_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let cutoff = now - Duration::minutes(max_age_minutes);
        let from = processing_day(now - Duration::days(self.config.retention_days));
        let to = processing_day(now);
        let table = self.table.as_ref();
        let rows = self
            .retry
            .run("query processing", move || {
                table.query_status(ProcessingStatus::Processing, from, to)
            })
            .await?;

        let message = format!("Processing timed out after {max_age_minutes} minutes");
        let mut repaired = 0;
        for row in rows
            .iter()
            .filter(|r| !r.is_expired(now) && r.created_at < cutoff)
        {
            let update = StatusUpdate::failed(&message).for_attempt(row.attempt());
            match self.table.update(&row.key(), &update, now).await {
                Ok(_) => {
                    log::info!("Cleaned up stale processing record {}", row.key());
                    repaired += 1;
                }
                // Finished or reclaimed between the query and the update
                Err(e @ AppError::Conflict(_)) => {
                    log::debug!("{} moved on: {}", row.key(), e);
                }
                Err(e) => log::warn!("Failed to clean up {}: {}", row.key(), e),
            }
        }

        log::info!("Cleaned up {} stale processing records", repaired);
        Ok(repaired)
    }

    /// Most recent records for a creator, newest first.
    pub async fn history(&self, creator: &str, limit: usize) -> Result<Vec<ProcessingRecord>> {
        self.recent(creator, limit, Utc::now()).await
    }

    pub async fn health_check(&self) -> HealthStatus {
        let result = self.table.ping().await;
        if let Err(e) = &result {
            log::error!("State table health check failed: {}", e);
        }
        HealthStatus {
            healthy: result.is_ok(),
            table_name: self.config.table_name.clone(),
            error: result.err().map(|e| e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryRecordTable;

    fn setup() -> (Arc<MemoryRecordTable>, ProcessingStateStore) {
        let table = Arc::new(MemoryRecordTable::new());
        let store = ProcessingStateStore::new(table.clone(), StateConfig::default())
            .with_retry(RetryPolicy::none());
        (table, store)
    }

    fn record(creator: &str, hash: &str, at: DateTime<Utc>) -> ProcessingRecord {
        ProcessingRecord::started(creator, "run-0000", hash, 3, "{}".into(), at, Duration::days(30))
    }

    #[tokio::test]
    async fn test_no_records_not_processed() {
        let (_, store) = setup();
        let decision = store.check_processed("jane", Some("h1"), None).await.unwrap();
        assert!(!decision.processed);
        assert_eq!(decision.reason, ProcessedReason::NoRecords);
    }

    #[tokio::test]
    async fn test_completed_same_content_is_processed() {
        let (table, store) = setup();
        let now = Utc::now();
        let mut row = record("Jane Doe", "h1", now);
        row.apply(&StatusUpdate::completed("k", 10), now);
        table.seed(row).await;

        let same = store.check_processed("jane doe", Some("h1"), None).await.unwrap();
        assert!(same.processed);
        assert_eq!(same.reason, ProcessedReason::SameContentCompleted);

        let changed = store.check_processed("Jane Doe", Some("h2"), None).await.unwrap();
        assert!(!changed.processed);
        assert!(changed.content_changed);
    }

    #[tokio::test]
    async fn test_completed_today_without_fingerprint() {
        let (table, store) = setup();
        let now = Utc::now();
        let mut row = record("jane", "h1", now);
        row.apply(&StatusUpdate::completed("k", 10), now);
        table.seed(row).await;

        let today = store.check_processed_at("jane", None, None, now).await.unwrap();
        assert_eq!(today.reason, ProcessedReason::CompletedToday);

        let tomorrow = now + Duration::days(1);
        let later = store
            .check_processed_at("jane", None, None, tomorrow)
            .await
            .unwrap();
        assert!(!later.processed);
        assert_eq!(later.reason, ProcessedReason::PreviousIncomplete);
    }

    #[tokio::test]
    async fn test_in_flight_then_stale() {
        let (table, store) = setup();
        let started = Utc::now();
        table.seed(record("jane", "h1", started)).await;

        let fresh = store
            .check_processed_at("jane", Some("h1"), None, started + Duration::minutes(5))
            .await
            .unwrap();
        assert!(fresh.processed);
        assert_eq!(fresh.reason, ProcessedReason::InFlight);

        let stale = store
            .check_processed_at("jane", Some("h1"), None, started + Duration::minutes(31))
            .await
            .unwrap();
        assert!(!stale.processed);
        assert!(stale.stale);
    }

    #[tokio::test]
    async fn test_expired_rows_ignored() {
        let (table, store) = setup();
        let long_ago = Utc::now() - Duration::days(40);
        let mut row = record("jane", "h1", long_ago);
        row.apply(&StatusUpdate::completed("k", 10), long_ago);
        table.seed(row).await;

        let decision = store.check_processed("jane", Some("h1"), None).await.unwrap();
        assert_eq!(decision.reason, ProcessedReason::NoRecords);
        assert!(store.history("jane", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_create_single_winner() {
        let (_, store) = setup();
        let config = ProcessingConfig::default();
        let (a, b) = tokio::join!(
            store.create_record("Jane Doe", "run-a", "h1", 2, &config),
            store.create_record("jane doe", "run-b", "h1", 2, &config),
        );
        let wins = [a.unwrap(), b.unwrap()].iter().filter(|w| **w).count();
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_create_stores_canonical_config() {
        let (_, store) = setup();
        let config = ProcessingConfig::default();
        assert!(store.create_record("jane", "run-a", "h1", 2, &config).await.unwrap());
        let history = store.history("jane", 1).await.unwrap();
        assert_eq!(history[0].processing_config, to_canonical_json(&config).unwrap());
        assert_eq!(history[0].status, ProcessingStatus::Processing);
    }

    #[tokio::test]
    async fn test_update_status_and_batch_status() {
        let (_, store) = setup();
        let config = ProcessingConfig::default();
        let today = processing_day(Utc::now());
        for creator in ["a", "b", "c"] {
            assert!(store.create_record(creator, "run-1", "h", 4, &config).await.unwrap());
        }
        store
            .update_status("a", today, &StatusUpdate::completed("out/collages/a.jpg", 100))
            .await
            .unwrap();
        // Re-applying is idempotent
        store
            .update_status("a", today, &StatusUpdate::completed("out/collages/a.jpg", 100))
            .await
            .unwrap();
        store
            .mark_failed_best_effort("b", today, &StatusUpdate::failed("render failed"))
            .await;

        let err = store
            .update_status("a", today, &StatusUpdate::failed("late"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
        let missing = store
            .update_status("nobody", today, &StatusUpdate::failed("x"))
            .await
            .unwrap_err();
        assert!(matches!(missing, AppError::NotFound(_)));

        let status = store.batch_status("run-1").await.unwrap();
        assert_eq!(status.total_creators, 3);
        assert_eq!(status.status_counts[&ProcessingStatus::Completed], 1);
        assert_eq!(status.status_counts[&ProcessingStatus::Failed], 1);
        assert_eq!(status.status_counts[&ProcessingStatus::Processing], 1);
        assert!((status.completion_percentage - 100.0 / 3.0).abs() < 1e-9);

        let stats = store.statistics(7).await.unwrap();
        assert_eq!(stats.total_creators_processed, 1);
        assert_eq!(stats.total_images_processed, 4);
        assert!((stats.average_duration_per_creator_ms - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_cleanup_stale_only_touches_old_rows() {
        let (table, store) = setup();
        let now = Utc::now();
        table.seed(record("old", "h", now - Duration::minutes(45))).await;
        table.seed(record("fresh", "h", now - Duration::minutes(5))).await;

        let repaired = store.cleanup_stale_at(30, now).await.unwrap();
        assert_eq!(repaired, 1);

        let old = store.history("old", 1).await.unwrap();
        assert_eq!(old[0].status, ProcessingStatus::Failed);
        assert_eq!(
            old[0].error_message.as_deref(),
            Some("Processing timed out after 30 minutes")
        );
        let fresh = store.history("fresh", 1).await.unwrap();
        assert_eq!(fresh[0].status, ProcessingStatus::Processing);
    }

    #[tokio::test]
    async fn test_reclaim_stale_loses_to_newer_claim() {
        let (table, store) = setup();
        let config = ProcessingConfig::default();
        let noon = Utc::now().date_naive().and_hms_opt(12, 0, 0).unwrap().and_utc();
        let stale = record("jane", "h", noon - Duration::minutes(40));
        table.seed(stale.clone()).await;

        // First worker reclaims and claims the slot
        assert!(store.reclaim_stale(&stale, "reclaimed").await.unwrap());
        assert!(
            store
                .create_record_at("jane", "run-a", "h", 3, &config, noon)
                .await
                .unwrap()
        );

        // Second worker acted on the same stale read
        assert!(!store.reclaim_stale(&stale, "reclaimed").await.unwrap());
        assert!(
            !store
                .create_record_at("jane", "run-b", "h", 3, &config, noon)
                .await
                .unwrap()
        );

        let row = table.get(&stale.key()).await.unwrap().unwrap();
        assert_eq!(row.status, ProcessingStatus::Processing);
        assert_eq!(row.batch_id, "run-a");
    }

    #[tokio::test]
    async fn test_created_records_carry_request_id() {
        let table = Arc::new(MemoryRecordTable::new());
        let store = ProcessingStateStore::new(table.clone(), StateConfig::default())
            .with_retry(RetryPolicy::none())
            .with_request_id("req-123");
        let config = ProcessingConfig::default();
        assert!(store.create_record("jane", "run-1", "h", 1, &config).await.unwrap());

        let history = store.history("jane", 1).await.unwrap();
        assert_eq!(history[0].request_id.as_deref(), Some("req-123"));
    }

    #[tokio::test]
    async fn test_health_check_reports_outage() {
        let (table, store) = setup();
        assert!(store.health_check().await.healthy);
        table.set_unavailable(true);
        let health = store.health_check().await;
        assert!(!health.healthy);
        assert!(health.error.is_some());
    }
}
