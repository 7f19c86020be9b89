// src/config.rs

//! Configuration loading utilities.
//!
//! Local runs read a TOML file. The Lambda runtime starts from defaults and
//! applies environment overrides on top.

use std::path::Path;
use std::str::FromStr;

use crate::error::Result;
use crate::models::Config;

/// Load configuration from a TOML file.
///
/// Falls back to defaults if loading fails.
pub fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).or_else(|e| {
        log::warn!("Failed to load config from {:?}: {}", path, e);
        log::warn!("Using default configuration.");
        Ok(Config::default())
    })
}

/// Load and validate configuration, failing on any problem.
pub fn load_strict(path: &Path) -> Result<Config> {
    let config = Config::load(path)?;
    config.validate()?;
    Ok(config)
}

/// Defaults plus overrides from the process environment.
pub fn from_env() -> Result<Config> {
    let config = apply_env_overrides(Config::default(), |name| std::env::var(name).ok());
    config.validate()?;
    Ok(config)
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, slot: &mut T) {
    let Some(raw) = lookup(name) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => log::warn!("Ignoring unparseable {}={:?}", name, raw),
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, name: &str, slot: &mut bool) {
    let Some(raw) = lookup(name) else {
        return;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => *slot = true,
        "false" | "0" | "no" => *slot = false,
        _ => log::warn!("Ignoring unparseable {}={:?}", name, raw),
    }
}

/// Apply environment overrides read through `lookup`.
pub fn apply_env_overrides(
    mut config: Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Config {
    if let Some(bucket) = lookup("OUTPUT_BUCKET") {
        config.storage.output_bucket = bucket;
    }
    if let Some(prefix) = lookup("OUTPUT_PREFIX") {
        config.storage.output_prefix = prefix;
    }
    if let Some(table) = lookup("STATE_TABLE") {
        config.state.table_name = table;
    }
    if let Some(algorithm) = lookup("HASH_ALGORITHM") {
        config.dedup.hash_algorithm = algorithm.trim().to_lowercase();
    }
    parse_flag(&lookup, "ENABLE_DEDUPLICATION", &mut config.dedup.enabled);
    parse_flag(&lookup, "FORCE_REPROCESS", &mut config.dedup.force_reprocess);
    parse_into(&lookup, "STALE_AFTER_MINUTES", &mut config.state.stale_after_minutes);

    let processing = &mut config.processing;
    parse_into(&lookup, "DEFAULT_ROWS", &mut processing.rows);
    parse_into(&lookup, "DEFAULT_COLS", &mut processing.cols);
    parse_into(&lookup, "DEFAULT_QUALITY", &mut processing.quality);
    parse_into(&lookup, "DEFAULT_MAX_WORKERS", &mut processing.max_workers);
    parse_into(&lookup, "DEFAULT_TIMEOUT", &mut processing.timeout_secs);
    parse_into(&lookup, "DEFAULT_MAX_RETRIES", &mut processing.max_retries);
    parse_into(
        &lookup,
        "DEFAULT_MAX_IMAGES_PER_CREATOR",
        &mut processing.max_images_per_creator,
    );

    config
}
