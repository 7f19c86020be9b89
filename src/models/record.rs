//! Per-creator processing records and their state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::normalize_creator;

/// Processing day for a timestamp (UTC calendar date).
pub fn processing_day(at: DateTime<Utc>) -> NaiveDate {
    at.date_naive()
}

/// Lifecycle of one production attempt.
///
/// `processing -> completed` and `processing -> failed` are the only
/// transitions. Re-applying the current terminal status is accepted so that
/// status updates stay idempotent under retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Processing)
    }

    pub fn can_transition_to(&self, next: ProcessingStatus) -> bool {
        match (self, next) {
            (Self::Processing, Self::Completed | Self::Failed) => true,
            (current, next) => current.is_terminal() && *current == next,
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(AppError::validation(format!("unknown status '{other}'"))),
        }
    }
}

/// Primary key of a processing record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    /// Normalized creator identity
    pub creator: String,
    /// UTC processing day
    pub day: NaiveDate,
}

impl RecordKey {
    pub fn new(creator: &str, day: NaiveDate) -> Self {
        Self {
            creator: normalize_creator(creator),
            day,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.creator, self.day)
    }
}

/// One production attempt for a (creator, day).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    /// Normalized creator identity (partition key)
    pub creator: String,

    /// UTC processing day (sort key)
    pub processing_date: NaiveDate,

    pub status: ProcessingStatus,

    /// Fingerprint of the content being produced
    pub content_hash: String,

    /// Batch that claimed this creator
    pub batch_id: String,

    pub image_count: usize,

    /// Canonical JSON of the processing config used
    #[serde(default)]
    pub processing_config: String,

    /// Object key of the produced artifact
    #[serde(default)]
    pub artifact_key: Option<String>,

    #[serde(default)]
    pub duration_ms: Option<u64>,

    #[serde(default)]
    pub error_message: Option<String>,

    /// Invocation that created the record, when known
    #[serde(default)]
    pub request_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Expiry as epoch seconds (store-side TTL attribute)
    pub expires_at: i64,
}

impl ProcessingRecord {
    /// Build a fresh `processing` record.
    pub fn started(
        creator: &str,
        batch_id: &str,
        content_hash: &str,
        image_count: usize,
        processing_config: String,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Self {
        Self {
            creator: normalize_creator(creator),
            processing_date: processing_day(now),
            status: ProcessingStatus::Processing,
            content_hash: content_hash.to_string(),
            batch_id: batch_id.to_string(),
            image_count,
            processing_config,
            artifact_key: None,
            duration_ms: None,
            error_message: None,
            request_id: None,
            created_at: now,
            updated_at: now,
            expires_at: (now + retention).timestamp(),
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            creator: self.creator.clone(),
            day: self.processing_date,
        }
    }

    pub fn attempt(&self) -> AttemptId {
        AttemptId::new(&self.batch_id, self.created_at)
    }

    /// Whether the retention window has elapsed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now.timestamp()
    }

    /// Time since the attempt started.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    /// Apply a status update in place.
    pub fn apply(&mut self, update: &StatusUpdate, now: DateTime<Utc>) {
        self.status = update.status;
        self.updated_at = now;
        if let Some(key) = &update.artifact_key {
            self.artifact_key = Some(key.clone());
        }
        if let Some(ms) = update.duration_ms {
            self.duration_ms = Some(ms);
        }
        if let Some(message) = &update.error_message {
            self.error_message = Some(message.clone());
        }
    }
}

/// Identity of one production attempt on a (creator, day) row.
///
/// Every new claim rewrites the row under the same key, so the key alone
/// cannot tell two attempts apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptId {
    pub batch_id: String,
    pub created_at: DateTime<Utc>,
}

impl AttemptId {
    pub fn new(batch_id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            batch_id: batch_id.into(),
            created_at,
        }
    }

    /// Whether `record` is still this attempt and still in flight.
    pub fn owns(&self, record: &ProcessingRecord) -> bool {
        record.status == ProcessingStatus::Processing
            && record.batch_id == self.batch_id
            && record.created_at == self.created_at
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.batch_id, self.created_at.to_rfc3339())
    }
}

/// Terminal status change with its optional payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: ProcessingStatus,
    #[serde(default)]
    pub artifact_key: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,

    /// Apply only while this attempt still owns the row in flight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<AttemptId>,
}

impl StatusUpdate {
    pub fn completed(artifact_key: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            status: ProcessingStatus::Completed,
            artifact_key: Some(artifact_key.into()),
            duration_ms: Some(duration_ms),
            error_message: None,
            attempt: None,
        }
    }

    pub fn failed(error_message: impl Into<String>) -> Self {
        Self {
            status: ProcessingStatus::Failed,
            artifact_key: None,
            duration_ms: None,
            error_message: Some(error_message.into()),
            attempt: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Guard the update on the row still belonging to `attempt`.
    pub fn for_attempt(mut self, attempt: AttemptId) -> Self {
        self.attempt = Some(attempt);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use ProcessingStatus::*;
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Completed.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Processing.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Processing));
    }

    #[test]
    fn test_status_round_trip_str() {
        for status in [
            ProcessingStatus::Processing,
            ProcessingStatus::Completed,
            ProcessingStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ProcessingStatus>().unwrap(), status);
        }
        assert!("done".parse::<ProcessingStatus>().is_err());
    }

    #[test]
    fn test_started_record() {
        let now = Utc::now();
        let record = ProcessingRecord::started(
            " Jane Doe ",
            "run-0001",
            "abc",
            12,
            "{}".into(),
            now,
            Duration::days(30),
        );
        assert_eq!(record.creator, "jane doe");
        assert_eq!(record.status, ProcessingStatus::Processing);
        assert_eq!(record.processing_date, processing_day(now));
        assert!(!record.is_expired(now));
        assert!(record.is_expired(now + Duration::days(31)));
        assert_eq!(record.key(), RecordKey::new("JANE DOE", processing_day(now)));
    }

    #[test]
    fn test_apply_update() {
        let now = Utc::now();
        let mut record =
            ProcessingRecord::started("a", "b", "h", 1, "{}".into(), now, Duration::days(30));
        record.apply(&StatusUpdate::completed("out/collages/a.jpg", 1500), now);
        assert_eq!(record.status, ProcessingStatus::Completed);
        assert_eq!(record.artifact_key.as_deref(), Some("out/collages/a.jpg"));
        assert_eq!(record.duration_ms, Some(1500));
        assert!(record.error_message.is_none());
    }

    #[test]
    fn test_attempt_owns_only_its_in_flight_row() {
        let now = Utc::now();
        let mut record =
            ProcessingRecord::started("a", "run-1", "h", 1, "{}".into(), now, Duration::days(30));
        let attempt = record.attempt();
        assert!(attempt.owns(&record));

        let newer = ProcessingRecord::started(
            "a",
            "run-2",
            "h",
            1,
            "{}".into(),
            now + Duration::seconds(1),
            Duration::days(30),
        );
        assert!(!attempt.owns(&newer));

        record.apply(&StatusUpdate::failed("timed out"), now);
        assert!(!attempt.owns(&record));
    }
}
