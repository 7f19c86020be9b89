//! DynamoDB record table.
//!
//! ## Table layout
//!
//! ```text
//! partition key   creator_name     (S, normalized identity)
//! sort key        processing_date  (S, YYYY-MM-DD)
//! TTL attribute   expires_at       (N, epoch seconds)
//! GSI batch       batch_id
//! GSI status      status + processing_date
//! ```
//!
//! Conditional writes carry the compare-and-set: an insert only succeeds when
//! no row exists or the existing row is not `processing`, and an update only
//! succeeds when the row exists and sits in a state that may move to the
//! requested one.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::types::{AttributeValue, ReturnValue};
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info, instrument, warn};

use crate::error::{AppError, Result};
use crate::models::{
    ProcessingRecord, ProcessingStatus, RecordKey, StateConfig, StatusUpdate, normalize_creator,
};
use crate::storage::RecordTable;

type Item = HashMap<String, AttributeValue>;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// DynamoDB-backed record table.
#[derive(Debug, Clone)]
pub struct DynamoRecordTable {
    client: Client,
    table_name: String,
    batch_index: String,
    status_index: String,
}

impl DynamoRecordTable {
    pub fn new(client: Client, config: &StateConfig) -> Self {
        Self {
            client,
            table_name: config.table_name.clone(),
            batch_index: config.batch_index.clone(),
            status_index: config.status_index.clone(),
        }
    }

    /// Create a table client from the ambient AWS configuration.
    pub async fn from_env(config: &StateConfig) -> Self {
        let aws = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&aws), config)
    }

    fn key_item(key: &RecordKey) -> Item {
        HashMap::from([
            ("creator_name".to_string(), s(&key.creator)),
            (
                "processing_date".to_string(),
                s(&key.day.format(DATE_FORMAT).to_string()),
            ),
        ])
    }

    /// Run a paginated query, collecting every page.
    async fn query_all(
        &self,
        index: &str,
        condition: &str,
        names: Option<HashMap<String, String>>,
        values: Item,
    ) -> Result<Vec<ProcessingRecord>> {
        let mut records = Vec::new();
        let mut start_key: Option<Item> = None;

        loop {
            let output = self
                .client
                .query()
                .table_name(&self.table_name)
                .index_name(index)
                .key_condition_expression(condition)
                .set_expression_attribute_names(names.clone())
                .set_expression_attribute_values(Some(values.clone()))
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(|e| AppError::store(DisplayErrorContext(e)))?;

            for item in output.items() {
                records.push(from_item(item)?);
            }

            match output.last_evaluated_key() {
                Some(last) if !last.is_empty() => start_key = Some(last.clone()),
                _ => break,
            }
        }

        Ok(records)
    }
}

fn s(value: &str) -> AttributeValue {
    AttributeValue::S(value.to_string())
}

fn n(value: impl ToString) -> AttributeValue {
    AttributeValue::N(value.to_string())
}

/// Serialize a record into DynamoDB attributes.
pub fn to_item(record: &ProcessingRecord) -> Item {
    let mut item = HashMap::from([
        ("creator_name".to_string(), s(&record.creator)),
        (
            "processing_date".to_string(),
            s(&record.processing_date.format(DATE_FORMAT).to_string()),
        ),
        ("status".to_string(), s(record.status.as_str())),
        ("content_hash".to_string(), s(&record.content_hash)),
        ("batch_id".to_string(), s(&record.batch_id)),
        ("image_count".to_string(), n(record.image_count)),
        ("processing_config".to_string(), s(&record.processing_config)),
        ("created_at".to_string(), s(&record.created_at.to_rfc3339())),
        ("updated_at".to_string(), s(&record.updated_at.to_rfc3339())),
        ("expires_at".to_string(), n(record.expires_at)),
    ]);
    if let Some(key) = &record.artifact_key {
        item.insert("artifact_key".to_string(), s(key));
    }
    if let Some(ms) = record.duration_ms {
        item.insert("duration_ms".to_string(), n(ms));
    }
    if let Some(message) = &record.error_message {
        item.insert("error_message".to_string(), s(message));
    }
    if let Some(request_id) = &record.request_id {
        item.insert("request_id".to_string(), s(request_id));
    }
    item
}

fn get_s<'a>(item: &'a Item, name: &str) -> Option<&'a str> {
    item.get(name)
        .and_then(|v| v.as_s().ok())
        .map(String::as_str)
}

fn require_s<'a>(item: &'a Item, name: &str) -> Result<&'a str> {
    get_s(item, name).ok_or_else(|| AppError::validation(format!("record missing '{name}'")))
}

fn get_n<T: std::str::FromStr>(item: &Item, name: &str) -> Option<T> {
    item.get(name)
        .and_then(|v| v.as_n().ok())
        .and_then(|raw| raw.parse().ok())
}

fn parse_time(item: &Item, name: &str) -> Result<DateTime<Utc>> {
    let raw = require_s(item, name)?;
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::validation(format!("record field '{name}': {e}")))
}

/// Deserialize DynamoDB attributes into a record.
pub fn from_item(item: &Item) -> Result<ProcessingRecord> {
    let day = require_s(item, "processing_date")?;
    Ok(ProcessingRecord {
        creator: require_s(item, "creator_name")?.to_string(),
        processing_date: NaiveDate::parse_from_str(day, DATE_FORMAT)
            .map_err(|e| AppError::validation(format!("record field 'processing_date': {e}")))?,
        status: require_s(item, "status")?.parse()?,
        content_hash: get_s(item, "content_hash").unwrap_or_default().to_string(),
        batch_id: get_s(item, "batch_id").unwrap_or_default().to_string(),
        image_count: get_n(item, "image_count").unwrap_or(0),
        processing_config: get_s(item, "processing_config")
            .unwrap_or_default()
            .to_string(),
        artifact_key: get_s(item, "artifact_key").map(str::to_string),
        duration_ms: get_n(item, "duration_ms"),
        error_message: get_s(item, "error_message").map(str::to_string),
        request_id: get_s(item, "request_id").map(str::to_string),
        created_at: parse_time(item, "created_at")?,
        updated_at: parse_time(item, "updated_at")?,
        expires_at: get_n(item, "expires_at").unwrap_or(0),
    })
}

#[async_trait]
impl RecordTable for DynamoRecordTable {
    #[instrument(skip(self, record), fields(creator = %record.creator))]
    async fn insert_if_idle(&self, record: &ProcessingRecord) -> Result<bool> {
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(to_item(record)))
            .condition_expression("attribute_not_exists(creator_name) OR #status <> :processing")
            .expression_attribute_names("#status", "status")
            .expression_attribute_values(":processing", s(ProcessingStatus::Processing.as_str()))
            .send()
            .await;

        match result {
            Ok(_) => {
                debug!("Inserted processing record {}", record.key());
                Ok(true)
            }
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_conditional_check_failed_exception() {
                    info!("Record {} already in flight", record.key());
                    Ok(false)
                } else {
                    Err(AppError::store(DisplayErrorContext(service_err)))
                }
            }
        }
    }

    #[instrument(skip(self, update), fields(status = %update.status))]
    async fn update(
        &self,
        key: &RecordKey,
        update: &StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<ProcessingRecord> {
        if update.status == ProcessingStatus::Processing {
            return match self.get(key).await? {
                Some(existing) => Err(AppError::transition(existing.status, update.status)),
                None => Err(AppError::not_found(format!("record {key}"))),
            };
        }

        let mut expression = String::from("SET #status = :status, updated_at = :updated_at");
        let mut values: Item = HashMap::from([
            (":status".to_string(), s(update.status.as_str())),
            (":updated_at".to_string(), s(&now.to_rfc3339())),
            (
                ":processing".to_string(),
                s(ProcessingStatus::Processing.as_str()),
            ),
        ]);
        if let Some(artifact_key) = &update.artifact_key {
            expression.push_str(", artifact_key = :artifact_key");
            values.insert(":artifact_key".to_string(), s(artifact_key));
        }
        if let Some(ms) = update.duration_ms {
            expression.push_str(", duration_ms = :duration_ms");
            values.insert(":duration_ms".to_string(), n(ms));
        }
        if let Some(message) = &update.error_message {
            expression.push_str(", error_message = :error_message");
            values.insert(":error_message".to_string(), s(message));
        }

        let condition = match &update.attempt {
            Some(attempt) => {
                values.insert(":attempt_batch".to_string(), s(&attempt.batch_id));
                values.insert(
                    ":attempt_created".to_string(),
                    s(&attempt.created_at.to_rfc3339()),
                );
                "attribute_exists(creator_name) AND #status = :processing \
                 AND batch_id = :attempt_batch AND created_at = :attempt_created"
            }
            None => {
                "attribute_exists(creator_name) AND (#status = :processing OR #status = :status)"
            }
        };

        let result = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .set_key(Some(Self::key_item(key)))
            .update_expression(expression)
            .condition_expression(condition)
            .expression_attribute_names("#status", "status")
            .set_expression_attribute_values(Some(values))
            .return_values(ReturnValue::AllNew)
            .send()
            .await;

        match result {
            Ok(output) => match output.attributes() {
                Some(attributes) => from_item(attributes),
                None => Err(AppError::store("update returned no attributes")),
            },
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_conditional_check_failed_exception() {
                    warn!("Rejected status update for {}", key);
                    match (self.get(key).await?, &update.attempt) {
                        (None, _) => Err(AppError::not_found(format!("record {key}"))),
                        (Some(existing), Some(attempt)) if !attempt.owns(&existing) => Err(
                            AppError::conflict(format!("{key} is no longer owned by {attempt}")),
                        ),
                        (Some(existing), _) => {
                            Err(AppError::transition(existing.status, update.status))
                        }
                    }
                } else {
                    Err(AppError::store(DisplayErrorContext(service_err)))
                }
            }
        }
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<ProcessingRecord>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .set_key(Some(Self::key_item(key)))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| AppError::store(DisplayErrorContext(e)))?;

        output.item().map(from_item).transpose()
    }

    async fn query_creator(&self, creator: &str, limit: usize) -> Result<Vec<ProcessingRecord>> {
        let output = self
            .client
            .query()
            .table_name(&self.table_name)
            .key_condition_expression("creator_name = :creator")
            .expression_attribute_values(":creator", s(&normalize_creator(creator)))
            .scan_index_forward(false)
            .limit(limit.min(i32::MAX as usize) as i32)
            .send()
            .await
            .map_err(|e| AppError::store(DisplayErrorContext(e)))?;

        output.items().iter().map(from_item).collect()
    }

    async fn query_batch(&self, batch_id: &str) -> Result<Vec<ProcessingRecord>> {
        self.query_all(
            &self.batch_index,
            "batch_id = :batch_id",
            None,
            HashMap::from([(":batch_id".to_string(), s(batch_id))]),
        )
        .await
    }

    async fn query_status(
        &self,
        status: ProcessingStatus,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ProcessingRecord>> {
        self.query_all(
            &self.status_index,
            "#status = :status AND processing_date BETWEEN :from AND :to",
            Some(HashMap::from([("#status".to_string(), "status".to_string())])),
            HashMap::from([
                (":status".to_string(), s(status.as_str())),
                (":from".to_string(), s(&from.format(DATE_FORMAT).to_string())),
                (":to".to_string(), s(&to.format(DATE_FORMAT).to_string())),
            ]),
        )
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .describe_table()
            .table_name(&self.table_name)
            .send()
            .await
            .map_err(|e| AppError::store(DisplayErrorContext(e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn test_item_round_trip() {
        let now = Utc::now();
        let mut record = ProcessingRecord::started(
            "Jane Doe",
            "run-0003",
            "abc123",
            12,
            r#"{"rows":2}"#.into(),
            now,
            Duration::days(30),
        );
        record.apply(&StatusUpdate::completed("out/collages/jane_doe.jpg", 900), now);

        let item = to_item(&record);
        assert_eq!(get_s(&item, "creator_name"), Some("jane doe"));
        assert_eq!(get_s(&item, "status"), Some("completed"));
        assert!(!item.contains_key("error_message"));

        let decoded = from_item(&item).unwrap();
        assert_eq!(decoded.creator, record.creator);
        assert_eq!(decoded.processing_date, record.processing_date);
        assert_eq!(decoded.status, ProcessingStatus::Completed);
        assert_eq!(decoded.image_count, 12);
        assert_eq!(decoded.duration_ms, Some(900));
        assert_eq!(decoded.expires_at, record.expires_at);
        assert_eq!(decoded.created_at.timestamp(), record.created_at.timestamp());
    }

    #[test]
    fn test_from_item_rejects_missing_key() {
        let item = HashMap::from([("status".to_string(), s("completed"))]);
        assert!(from_item(&item).is_err());
    }
}
