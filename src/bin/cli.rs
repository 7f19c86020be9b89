//! collage-guard CLI
//!
//! Local execution entry point over the filesystem backends. For AWS Lambda,
//! use `collage-guard-lambda`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use collage_guard::{
    config,
    error::{AppError, Result},
    models::{Config, CreatorMap, PartitionerState},
    pipeline::BatchPartitioner,
    services::{CollisionDetector, ProcessingStateStore},
    storage::{LocalObjectStore, LocalRecordTable},
};
use serde::Serialize;

/// collage-guard - deduplication for per-creator collage production
#[derive(Parser, Debug)]
#[command(
    name = "collage-guard",
    version,
    about = "Fingerprinting, batch partitioning and processing state for collage runs"
)]
struct Cli {
    /// Path to storage directory containing config files
    #[arg(short, long, default_value = "storage")]
    storage_dir: PathBuf,

    /// Config file (default: {storage_dir}/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Split a creator work list into disjoint batches
    Partition {
        /// JSON file mapping creator name to URL list
        input: PathBuf,

        /// Target URL count per batch
        #[arg(long)]
        target: Option<usize>,

        /// Sticky assignments from a previous run
        #[arg(long)]
        state: Option<PathBuf>,

        /// Write the resulting assignments here
        #[arg(long)]
        save_state: Option<PathBuf>,

        /// Prefix for batch ids
        #[arg(long, default_value = "local")]
        run_id: String,
    },

    /// Print the content fingerprint and artifact key for a creator
    Fingerprint {
        #[arg(long)]
        creator: String,

        #[arg(long, num_args = 1..)]
        urls: Vec<String>,
    },

    /// Decide whether a creator needs production
    Check {
        #[arg(long)]
        creator: String,

        #[arg(long, num_args = 1..)]
        urls: Vec<String>,

        /// Ignore existing artifacts
        #[arg(long)]
        force: bool,
    },

    /// Show processing progress for a batch
    Status {
        batch_id: String,
    },

    /// Show recent processing records for a creator
    History {
        creator: String,

        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Summarize completed work over recent days
    Stats {
        #[arg(long, default_value_t = 7)]
        days: i64,

        /// Also summarize stored artifacts
        #[arg(long)]
        artifacts: bool,
    },

    /// Mark abandoned processing records as failed
    CleanupStale {
        /// Age threshold (default: state.stale_after_minutes)
        #[arg(long)]
        max_age_minutes: Option<i64>,
    },

    /// Delete all but the newest artifacts of a creator
    CleanupArtifacts {
        creator: String,

        #[arg(long, default_value_t = 1)]
        keep: usize,
    },

    /// Validate configuration, state table and optionally one artifact
    Validate {
        /// Artifact key to check for size and content type
        #[arg(long)]
        artifact: Option<String>,
    },
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.storage_dir.join("config.toml"));
    let config: Config = config::load_config(&config_path)?;
    log::debug!("Loaded configuration from {}", config_path.display());

    // Artifacts and state records live under storage.local_root
    let local_root = PathBuf::from(&config.storage.local_root);
    let objects = Arc::new(LocalObjectStore::new(&local_root));
    let records = Arc::new(LocalRecordTable::new(local_root.join("state")));
    let prefix = config.storage.output_prefix.clone();

    let detector = CollisionDetector::new(objects, &config)?;
    let state = ProcessingStateStore::new(records, config.state.clone());

    match cli.command {
        Command::Partition {
            input,
            target,
            state: state_path,
            save_state,
            run_id,
        } => {
            let creators: CreatorMap = read_json(&input)?;
            let mut partitioner =
                BatchPartitioner::new(&config.dedup.hash_algorithm, config.partition.clone())?;
            if let Some(path) = state_path {
                let saved: PartitionerState = read_json(&path)?;
                partitioner.import_state(saved);
            }

            let target = target.unwrap_or(config.partition.target_batch_size);
            let batches = partitioner.partition(&creators, target)?;
            let stats = partitioner.stats(&batches, target);
            for batch in &batches {
                log::info!(
                    "{}: {} creators, {} URLs",
                    batch.id(&run_id),
                    batch.creator_count(),
                    batch.size()
                );
            }

            if let Some(path) = save_state {
                let json = serde_json::to_string_pretty(&partitioner.export_state())?;
                std::fs::write(&path, json)?;
                log::info!("Partitioner state saved to {}", path.display());
            }
            print_json(&serde_json::json!({ "batches": batches, "stats": stats }))?;
        }

        Command::Fingerprint { creator, urls } => {
            let fingerprinter = detector.fingerprinter();
            let fingerprint =
                fingerprinter.fingerprint(&creator, &urls, Some(&config.processing))?;
            print_json(&serde_json::json!({
                "creator": creator,
                "fingerprint": fingerprint,
                "url_set_fingerprint": fingerprinter.url_set_fingerprint(&urls)?,
                "artifact_key": detector.artifact_key_for(&creator, &fingerprint, &prefix),
                "hash": fingerprinter.info(),
            }))?;
        }

        Command::Check {
            creator,
            urls,
            force,
        } => {
            let collision = detector
                .should_skip(&creator, &urls, &prefix, Some(&config.processing), force)
                .await;
            let processed = state
                .check_processed(&creator, collision.fingerprint.as_deref(), None)
                .await?;
            print_json(&serde_json::json!({
                "collision": collision,
                "state": processed,
            }))?;
        }

        Command::Status { batch_id } => {
            print_json(&state.batch_status(&batch_id).await?)?;
        }

        Command::History { creator, limit } => {
            let history = state.history(&creator, limit).await?;
            if history.is_empty() {
                log::info!("No processing records for {}", creator);
            }
            print_json(&history)?;
        }

        Command::Stats { days, artifacts } => {
            let processing = state.statistics(days).await?;
            if artifacts {
                let stored = detector.collision_statistics(&prefix).await?;
                print_json(&serde_json::json!({
                    "processing": processing,
                    "artifacts": stored,
                }))?;
            } else {
                print_json(&processing)?;
            }
        }

        Command::CleanupStale { max_age_minutes } => {
            let minutes = max_age_minutes.unwrap_or(config.state.stale_after_minutes);
            let repaired = state.cleanup_stale(minutes).await?;
            log::info!(
                "Repaired {} stale records older than {} minutes",
                repaired,
                minutes
            );
        }

        Command::CleanupArtifacts { creator, keep } => {
            let report = detector.cleanup_old(&creator, keep, &prefix).await?;
            log::info!(
                "{}: kept {}, deleted {}, {} errors",
                creator,
                report.kept.len(),
                report.deleted.len(),
                report.errors.len()
            );
            print_json(&report)?;
        }

        Command::Validate { artifact } => {
            log::info!("Validating configuration...");
            if let Err(e) = config.validate() {
                log::error!("Config validation failed: {}", e);
                return Err(e);
            }
            log::info!("✓ Config OK");

            let health = state.health_check().await;
            if !health.healthy {
                return Err(AppError::store(
                    health.error.unwrap_or_else(|| "state table unavailable".into()),
                ));
            }
            log::info!("✓ State table OK");

            if let Some(key) = artifact {
                let result = detector.validate_integrity(&key).await?;
                print_json(&result)?;
                if !result.valid {
                    return Err(AppError::validation(format!("artifact {key} failed checks")));
                }
            }

            log::info!("All validations passed!");
        }
    }

    Ok(())
}
