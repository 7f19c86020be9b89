//! Batch and partitioner state structures.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Input work list: creator name to content URLs.
pub type CreatorMap = BTreeMap<String, Vec<String>>;

/// A disjoint group of creators rendered by one worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Batch {
    /// Position in the partition result
    pub index: usize,

    /// Creators in this batch, keyed by the name they were submitted with
    pub creators: CreatorMap,
}

impl Batch {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            creators: CreatorMap::new(),
        }
    }

    /// Total URL count across all creators.
    pub fn size(&self) -> usize {
        self.creators.values().map(Vec::len).sum()
    }

    pub fn creator_count(&self) -> usize {
        self.creators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.creators.is_empty()
    }

    /// Stable id used to tag processing records: `{run}-{index:04}`.
    pub fn id(&self, run: &str) -> String {
        format!("{}-{:04}", run, self.index)
    }
}

/// Summary statistics for a partition result. Advisory only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PartitionStats {
    pub batch_count: usize,
    pub creator_count: usize,
    pub total_urls: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub avg_size: f64,
    /// `(max - min) / avg`; lower is better
    pub balance_score: f64,
    pub target_batch_size: usize,
    /// Indices of multi-creator batches above the preferred overflow bound
    pub oversized_batches: Vec<usize>,
}

impl PartitionStats {
    /// Compute statistics for a set of batches.
    pub fn from_batches(batches: &[Batch], target_batch_size: usize, overflow_limit: f64) -> Self {
        if batches.is_empty() {
            return Self {
                target_batch_size,
                ..Self::default()
            };
        }

        let sizes: Vec<usize> = batches.iter().map(Batch::size).collect();
        let total_urls: usize = sizes.iter().sum();
        let min_size = sizes.iter().copied().min().unwrap_or(0);
        let max_size = sizes.iter().copied().max().unwrap_or(0);
        let avg_size = total_urls as f64 / batches.len() as f64;
        let balance_score = if avg_size > 0.0 {
            (max_size - min_size) as f64 / avg_size
        } else {
            0.0
        };

        let oversized_batches = batches
            .iter()
            .filter(|b| b.creator_count() > 1 && b.size() as f64 > overflow_limit)
            .map(|b| b.index)
            .collect();

        Self {
            batch_count: batches.len(),
            creator_count: batches.iter().map(Batch::creator_count).sum(),
            total_urls,
            min_size,
            max_size,
            avg_size,
            balance_score,
            target_batch_size,
            oversized_batches,
        }
    }
}

/// Sticky creator-to-batch assignments, exportable across processes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PartitionerState {
    /// Normalized creator identity to batch index
    #[serde(default)]
    pub assignments: BTreeMap<String, usize>,

    /// Batch index to member identities, from the most recent partition
    #[serde(default)]
    pub batch_creators: BTreeMap<usize, Vec<String>>,

    /// Batch index to URL count, from the most recent partition
    #[serde(default)]
    pub batch_sizes: BTreeMap<usize, usize>,

    /// Digest the assignments were computed with
    #[serde(default)]
    pub hash_algorithm: String,
}

impl PartitionerState {
    pub fn total_creators(&self) -> usize {
        self.assignments.len()
    }

    pub fn total_batches(&self) -> usize {
        self.batch_creators.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(index: usize, entries: &[(&str, usize)]) -> Batch {
        let mut b = Batch::new(index);
        for (name, count) in entries {
            let urls = (0..*count).map(|i| format!("http://x/{name}/{i}")).collect();
            b.creators.insert(name.to_string(), urls);
        }
        b
    }

    #[test]
    fn test_batch_size_and_id() {
        let b = batch(3, &[("a", 2), ("b", 5)]);
        assert_eq!(b.size(), 7);
        assert_eq!(b.creator_count(), 2);
        assert_eq!(b.id("run42"), "run42-0003");
    }

    #[test]
    fn test_stats_empty() {
        let stats = PartitionStats::from_batches(&[], 100, 150.0);
        assert_eq!(stats.batch_count, 0);
        assert_eq!(stats.target_batch_size, 100);
    }

    #[test]
    fn test_stats_values() {
        let batches = vec![batch(0, &[("a", 60), ("b", 55)]), batch(1, &[("c", 10)])];
        let stats = PartitionStats::from_batches(&batches, 100, 150.0);
        assert_eq!(stats.batch_count, 2);
        assert_eq!(stats.creator_count, 3);
        assert_eq!(stats.total_urls, 125);
        assert_eq!(stats.min_size, 10);
        assert_eq!(stats.max_size, 115);
        assert!((stats.avg_size - 62.5).abs() < f64::EPSILON);
        assert!(stats.oversized_batches.is_empty());
    }

    #[test]
    fn test_single_large_creator_not_oversized() {
        let batches = vec![batch(0, &[("big", 400)])];
        let stats = PartitionStats::from_batches(&batches, 100, 150.0);
        assert!(stats.oversized_batches.is_empty());
    }
}
