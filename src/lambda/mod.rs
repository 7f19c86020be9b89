// src/lambda/mod.rs

//! AWS Lambda handler.
//!
//! Every invocation carries an `action` naming one core operation. The
//! handler builds the services over S3 and DynamoDB, runs the action and
//! wraps the result in a [`GuardResponse`] envelope. Failures are reported in
//! the envelope rather than as invocation errors.

use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use lambda_runtime::{Error as LambdaError, LambdaEvent};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, info, instrument};

use crate::config;
use crate::error::Result;
use crate::models::{Config, CreatorMap, PartitionerState, ProcessingConfig, ProcessingOverrides};
use crate::pipeline::BatchPartitioner;
use crate::services::{CollisionDetector, ProcessingStateStore};
use crate::storage::{DynamoRecordTable, ObjectStore, RecordTable, S3ObjectStore};

fn default_days() -> i64 {
    7
}

fn default_history_limit() -> usize {
    10
}

/// Lambda invocation payload.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum GuardRequest {
    /// Split creators into disjoint batches
    Partition {
        creators: CreatorMap,
        #[serde(default)]
        target_batch_size: Option<usize>,
        /// Sticky assignments exported by a previous call
        #[serde(default)]
        state: Option<PartitionerState>,
        /// Prefix for batch ids (defaults to a timestamp)
        #[serde(default)]
        run_id: Option<String>,
    },

    /// Collision check for one creator
    ShouldSkip {
        creator: String,
        urls: Vec<String>,
        #[serde(default)]
        output_prefix: Option<String>,
        #[serde(default)]
        config: ProcessingOverrides,
        #[serde(default)]
        force_reprocess: bool,
    },

    /// Processing history check for one creator
    CheckProcessed {
        creator: String,
        /// Fingerprint to compare; computed from `urls` when absent
        #[serde(default)]
        fingerprint: Option<String>,
        #[serde(default)]
        urls: Option<Vec<String>>,
        #[serde(default)]
        config: ProcessingOverrides,
        #[serde(default)]
        day: Option<NaiveDate>,
    },

    BatchStatus {
        batch_id: String,
    },

    Statistics {
        #[serde(default = "default_days")]
        days: i64,
    },

    CleanupStale {
        #[serde(default)]
        max_age_minutes: Option<i64>,
    },

    History {
        creator: String,
        #[serde(default = "default_history_limit")]
        limit: usize,
    },

    Health,
}

impl GuardRequest {
    pub fn action(&self) -> &'static str {
        match self {
            Self::Partition { .. } => "partition",
            Self::ShouldSkip { .. } => "should_skip",
            Self::CheckProcessed { .. } => "check_processed",
            Self::BatchStatus { .. } => "batch_status",
            Self::Statistics { .. } => "statistics",
            Self::CleanupStale { .. } => "cleanup_stale",
            Self::History { .. } => "history",
            Self::Health => "health",
        }
    }
}

/// Lambda response payload.
#[derive(Debug, Serialize)]
pub struct GuardResponse {
    pub success: bool,
    pub action: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Error message if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Execution time in milliseconds
    pub execution_time_ms: u64,
}

/// Services shared by every action.
pub struct GuardContext {
    pub config: Config,
    pub detector: CollisionDetector,
    pub state: ProcessingStateStore,
}

impl GuardContext {
    pub fn new(
        config: Config,
        objects: Arc<dyn ObjectStore>,
        records: Arc<dyn RecordTable>,
    ) -> Result<Self> {
        let detector = CollisionDetector::new(objects, &config)?;
        let state = ProcessingStateStore::new(records, config.state.clone());
        Ok(Self {
            config,
            detector,
            state,
        })
    }

    /// S3 and DynamoDB backends configured from the environment.
    ///
    /// Records created through this context carry `request_id`.
    pub async fn from_env(request_id: &str) -> Result<Self> {
        let config = config::from_env()?;
        let objects = S3ObjectStore::from_env(config.storage.output_bucket.clone()).await;
        let records = DynamoRecordTable::from_env(&config.state).await;
        let mut ctx = Self::new(config, Arc::new(objects), Arc::new(records))?;
        ctx.state = ctx.state.with_request_id(request_id);
        Ok(ctx)
    }

    fn processing(&self, overrides: &ProcessingOverrides) -> Result<ProcessingConfig> {
        self.config.processing.merged(overrides)
    }
}

/// Main Lambda handler function.
#[instrument(skip(event), fields(action))]
pub async fn handler(
    event: LambdaEvent<GuardRequest>,
) -> std::result::Result<GuardResponse, LambdaError> {
    let start = Instant::now();
    let (request, context) = event.into_parts();
    let action = request.action();
    tracing::Span::current().record("action", action);
    info!("Handling {} (request {})", action, context.request_id);

    let result = match GuardContext::from_env(&context.request_id).await {
        Ok(ctx) => dispatch(&ctx, request).await,
        Err(e) => Err(e),
    };

    let execution_time_ms = start.elapsed().as_millis() as u64;
    match result {
        Ok(data) => {
            info!("{} completed in {}ms", action, execution_time_ms);
            Ok(GuardResponse {
                success: true,
                action: action.to_string(),
                data: Some(data),
                error: None,
                execution_time_ms,
            })
        }
        Err(e) => {
            error!("{} failed: {}", action, e);
            Ok(GuardResponse {
                success: false,
                action: action.to_string(),
                data: None,
                error: Some(e.to_string()),
                execution_time_ms,
            })
        }
    }
}

/// Run one action against the given services.
pub async fn dispatch(ctx: &GuardContext, request: GuardRequest) -> Result<Value> {
    match request {
        GuardRequest::Partition {
            creators,
            target_batch_size,
            state,
            run_id,
        } => {
            let mut partitioner = BatchPartitioner::new(
                &ctx.config.dedup.hash_algorithm,
                ctx.config.partition.clone(),
            )?;
            if let Some(state) = state {
                partitioner.import_state(state);
            }
            let target = target_batch_size.unwrap_or(ctx.config.partition.target_batch_size);
            let batches = partitioner.partition(&creators, target)?;
            let stats = partitioner.stats(&batches, target);
            let run_id =
                run_id.unwrap_or_else(|| Utc::now().format("%Y%m%d%H%M%S").to_string());
            let batch_ids: Vec<String> = batches.iter().map(|b| b.id(&run_id)).collect();
            Ok(json!({
                "batch_ids": batch_ids,
                "batches": batches,
                "stats": stats,
                "state": partitioner.export_state(),
            }))
        }

        GuardRequest::ShouldSkip {
            creator,
            urls,
            output_prefix,
            config,
            force_reprocess,
        } => {
            let processing = ctx.processing(&config)?;
            let prefix =
                output_prefix.unwrap_or_else(|| ctx.config.storage.output_prefix.clone());
            let decision = ctx
                .detector
                .should_skip(&creator, &urls, &prefix, Some(&processing), force_reprocess)
                .await;
            Ok(serde_json::to_value(decision)?)
        }

        GuardRequest::CheckProcessed {
            creator,
            fingerprint,
            urls,
            config,
            day,
        } => {
            let fingerprint = match (fingerprint, urls) {
                (Some(fingerprint), _) => Some(fingerprint),
                (None, Some(urls)) => {
                    let processing = ctx.processing(&config)?;
                    Some(ctx.detector.fingerprinter().fingerprint(
                        &creator,
                        &urls,
                        Some(&processing),
                    )?)
                }
                (None, None) => None,
            };
            let decision = ctx
                .state
                .check_processed(&creator, fingerprint.as_deref(), day)
                .await?;
            Ok(serde_json::to_value(decision)?)
        }

        GuardRequest::BatchStatus { batch_id } => {
            Ok(serde_json::to_value(ctx.state.batch_status(&batch_id).await?)?)
        }

        GuardRequest::Statistics { days } => {
            Ok(serde_json::to_value(ctx.state.statistics(days).await?)?)
        }

        GuardRequest::CleanupStale { max_age_minutes } => {
            let minutes = max_age_minutes.unwrap_or(ctx.config.state.stale_after_minutes);
            let repaired = ctx.state.cleanup_stale(minutes).await?;
            Ok(json!({ "repaired": repaired, "max_age_minutes": minutes }))
        }

        GuardRequest::History { creator, limit } => {
            let history = ctx.state.history(&creator, limit).await?;
            Ok(json!({ "creator": creator, "count": history.len(), "records": history }))
        }

        GuardRequest::Health => {
            let state = ctx.state.health_check().await;
            Ok(json!({
                "healthy": state.healthy,
                "state_table": state,
                "hash": ctx.detector.fingerprinter().info(),
            }))
        }
    }
}
