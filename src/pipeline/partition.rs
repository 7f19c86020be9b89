// src/pipeline/partition.rs

//! Hash-based batch partitioning with greedy rebalancing.
//!
//! Creators are placed largest first. Each creator has a preferred batch:
//! its sticky assignment from an earlier call, or the stable bucket hash of
//! its identity modulo one more than the current batch count. The preferred
//! batch is used while it stays within `preferred_overflow_factor * target`.
//! Otherwise the batch whose resulting size lands closest to the target is
//! used, never exceeding `max_overflow_factor * target`, and failing that a
//! new batch is opened. A creator's URLs are never split across batches.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{AppError, DuplicateCreator, Result};
use crate::models::{
    Batch, Creator, CreatorMap, PartitionConfig, PartitionStats, PartitionerState,
    normalize_creator,
};
use crate::pipeline::fingerprint::ContentFingerprinter;

/// Consistency report for the partitioner's own bookkeeping.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub consistent: bool,
    pub total_creators: usize,
    pub total_batches: usize,
    pub issues: Vec<String>,
}

/// Splits a creator map into disjoint, size-balanced batches.
///
/// Owns its sticky assignment state. Share it across processes with
/// [`BatchPartitioner::export_state`] and [`BatchPartitioner::import_state`].
#[derive(Debug, Clone)]
pub struct BatchPartitioner {
    fingerprinter: ContentFingerprinter,
    config: PartitionConfig,
    state: PartitionerState,
}

struct Entry {
    identity: String,
    name: String,
    urls: Vec<String>,
}

impl BatchPartitioner {
    pub fn new(hash_algorithm: &str, config: PartitionConfig) -> Result<Self> {
        config.validate()?;
        let fingerprinter = ContentFingerprinter::new(hash_algorithm)?;
        let state = PartitionerState {
            hash_algorithm: fingerprinter.algorithm().as_str().to_string(),
            ..PartitionerState::default()
        };
        log::info!(
            "Partitioner initialized with {} (target {})",
            hash_algorithm,
            config.target_batch_size
        );
        Ok(Self {
            fingerprinter,
            config,
            state,
        })
    }

    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    /// Partition using the configured target batch size.
    pub fn partition_default(&mut self, creators: &CreatorMap) -> Result<Vec<Batch>> {
        self.partition(creators, self.config.target_batch_size)
    }

    /// Partition `creators` into batches of roughly `target_batch_size` URLs.
    pub fn partition(
        &mut self,
        creators: &CreatorMap,
        target_batch_size: usize,
    ) -> Result<Vec<Batch>> {
        if target_batch_size == 0 {
            return Err(AppError::config("target batch size must be > 0"));
        }
        if creators.is_empty() {
            log::warn!("No creators provided for partitioning");
            self.state.batch_creators.clear();
            self.state.batch_sizes.clear();
            return Ok(Vec::new());
        }

        let mut entries = merge_identities(creators);
        entries.sort_by(|a, b| {
            b.urls
                .len()
                .cmp(&a.urls.len())
                .then_with(|| a.identity.cmp(&b.identity))
        });

        let total_urls: usize = entries.iter().map(|e| e.urls.len()).sum();
        log::info!(
            "Partitioning {} creators, {} URLs, target {} per batch",
            entries.len(),
            total_urls,
            target_batch_size
        );

        let preferred_limit = target_batch_size as f64 * self.config.preferred_overflow_factor;
        let max_limit = target_batch_size as f64 * self.config.max_overflow_factor;

        let mut batches: Vec<Batch> = Vec::new();
        let mut placed: Vec<(String, usize)> = Vec::with_capacity(entries.len());

        for entry in entries {
            let count = entry.urls.len();
            let preferred = self.preferred_batch(&entry.identity, batches.len());
            while batches.len() <= preferred {
                batches.push(Batch::new(batches.len()));
            }

            let target = if (batches[preferred].size() + count) as f64 <= preferred_limit {
                preferred
            } else {
                match best_alternative(&batches, count, target_batch_size, max_limit) {
                    Some(index) => index,
                    None => {
                        batches.push(Batch::new(batches.len()));
                        batches.len() - 1
                    }
                }
            };

            log::debug!(
                "Creator {} ({} URLs) -> batch {} (preferred {})",
                entry.identity,
                count,
                target,
                preferred
            );
            batches[target].creators.insert(entry.name, entry.urls);
            placed.push((entry.identity, target));
        }

        // Drop empty batches and renumber
        let mut remap = BTreeMap::new();
        let mut result = Vec::with_capacity(batches.len());
        for mut batch in batches.into_iter().filter(|b| !b.is_empty()) {
            remap.insert(batch.index, result.len());
            batch.index = result.len();
            result.push(batch);
        }

        self.state.batch_creators.clear();
        self.state.batch_sizes.clear();
        for (identity, index) in placed {
            let index = remap.get(&index).copied().unwrap_or(index);
            self.state.assignments.insert(identity.clone(), index);
            self.state
                .batch_creators
                .entry(index)
                .or_default()
                .push(identity);
        }
        for batch in &result {
            self.state.batch_sizes.insert(batch.index, batch.size());
        }

        validate_disjoint(&result)?;

        let stats = self.stats(&result, target_batch_size);
        log_stats(&stats);

        Ok(result)
    }

    fn preferred_batch(&self, identity: &str, batch_count: usize) -> usize {
        if let Some(&index) = self.state.assignments.get(identity) {
            return index;
        }
        (self.fingerprinter.bucket_hash(identity) % (batch_count as u32 + 1)) as usize
    }

    /// Advisory statistics for a partition result.
    pub fn stats(&self, batches: &[Batch], target_batch_size: usize) -> PartitionStats {
        PartitionStats::from_batches(
            batches,
            target_batch_size,
            target_batch_size as f64 * self.config.preferred_overflow_factor,
        )
    }

    /// Sticky batch index for a creator, if one was assigned.
    pub fn assignment(&self, creator: &str) -> Option<usize> {
        self.state
            .assignments
            .get(&normalize_creator(creator))
            .copied()
    }

    /// Creator identities placed in a batch by the most recent partition.
    pub fn batch_creators(&self, index: usize) -> &[String] {
        self.state
            .batch_creators
            .get(&index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn export_state(&self) -> PartitionerState {
        self.state.clone()
    }

    /// Replace the current state. Assignments made with another digest are
    /// still imported but will not match freshly hashed placements.
    pub fn import_state(&mut self, state: PartitionerState) {
        let ours = self.fingerprinter.algorithm().as_str();
        if !state.hash_algorithm.is_empty() && state.hash_algorithm != ours {
            log::warn!(
                "Imported partition state uses {} but partitioner uses {}",
                state.hash_algorithm,
                ours
            );
        }
        log::info!(
            "Imported {} assignments across {} batches",
            state.total_creators(),
            state.total_batches()
        );
        self.state = PartitionerState {
            hash_algorithm: ours.to_string(),
            ..state
        };
    }

    /// Forget every assignment.
    pub fn reset(&mut self) {
        let hash_algorithm = std::mem::take(&mut self.state.hash_algorithm);
        self.state = PartitionerState {
            hash_algorithm,
            ..PartitionerState::default()
        };
    }

    /// Check that batch membership agrees with the assignment map.
    pub fn verify_integrity(&self) -> IntegrityReport {
        let mut issues = Vec::new();
        let mut seen: BTreeMap<&str, usize> = BTreeMap::new();

        for (&index, members) in &self.state.batch_creators {
            for identity in members {
                if let Some(previous) = seen.insert(identity, index) {
                    issues.push(format!(
                        "{identity} listed in batches {previous} and {index}"
                    ));
                }
                match self.state.assignments.get(identity) {
                    Some(&assigned) if assigned == index => {}
                    Some(&assigned) => issues.push(format!(
                        "{identity} listed in batch {index} but assigned to {assigned}"
                    )),
                    None => issues.push(format!("{identity} listed in batch {index} but unassigned")),
                }
            }
        }

        IntegrityReport {
            consistent: issues.is_empty(),
            total_creators: self.state.total_creators(),
            total_batches: self.state.total_batches(),
            issues,
        }
    }
}

/// Collapse names that normalize to the same identity.
fn merge_identities(creators: &CreatorMap) -> Vec<Entry> {
    let mut by_identity: BTreeMap<String, Entry> = BTreeMap::new();
    for (name, urls) in creators {
        let identity = normalize_creator(name);
        match by_identity.get_mut(&identity) {
            Some(entry) => {
                log::warn!(
                    "Creator names {:?} and {:?} share identity {:?}; merging",
                    entry.name,
                    name,
                    identity
                );
                let mut combined = std::mem::take(&mut entry.urls);
                combined.extend(urls.iter().cloned());
                entry.urls = Creator::new(entry.name.clone(), combined).render_urls();
            }
            None => {
                by_identity.insert(
                    identity.clone(),
                    Entry {
                        identity,
                        name: name.clone(),
                        urls: urls.clone(),
                    },
                );
            }
        }
    }
    by_identity.into_values().collect()
}

/// Batch whose resulting size lands closest to the target, within `max_limit`.
fn best_alternative(
    batches: &[Batch],
    count: usize,
    target_batch_size: usize,
    max_limit: f64,
) -> Option<usize> {
    batches
        .iter()
        .map(|b| (b.index, b.size() + count))
        .filter(|&(_, new_size)| new_size as f64 <= max_limit)
        .min_by_key(|&(index, new_size)| (new_size.abs_diff(target_batch_size), index))
        .map(|(index, _)| index)
}

/// Fail if any creator identity appears more than once across `batches`.
pub fn validate_disjoint(batches: &[Batch]) -> Result<()> {
    let mut seen: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for batch in batches {
        for name in batch.creators.keys() {
            seen.entry(normalize_creator(name))
                .or_default()
                .push(batch.index);
        }
    }

    let duplicates: Vec<DuplicateCreator> = seen
        .into_iter()
        .filter(|(_, indices)| indices.len() > 1)
        .map(|(creator, batches)| DuplicateCreator { creator, batches })
        .collect();

    if duplicates.is_empty() {
        Ok(())
    } else {
        for duplicate in &duplicates {
            log::error!("Duplicate creator: {}", duplicate);
        }
        Err(AppError::Integrity { duplicates })
    }
}

fn log_stats(stats: &PartitionStats) {
    log::info!(
        "Partitioned into {} batches: {} creators, {} URLs, size min/avg/max {}/{:.1}/{}, balance {:.3}",
        stats.batch_count,
        stats.creator_count,
        stats.total_urls,
        stats.min_size,
        stats.avg_size,
        stats.max_size,
        stats.balance_score
    );
    if !stats.oversized_batches.is_empty() {
        log::warn!(
            "Batches {:?} exceed the preferred size bound for target {}",
            stats.oversized_batches,
            stats.target_batch_size
        );
    }
}
