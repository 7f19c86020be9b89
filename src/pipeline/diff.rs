//! URL-set diff calculation for change detection.
//!
//! Computes the difference between a creator's previous and current URL
//! sets so callers can tell what changed before an artifact is reproduced.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Difference between two URL sets. Lists are sorted.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct UrlDiff {
    /// In current but not in previous
    pub added: Vec<String>,
    /// In previous but not in current
    pub removed: Vec<String>,
    /// In both
    pub common: Vec<String>,
}

impl UrlDiff {
    /// Check if there are any changes.
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    /// Get the total number of changes.
    pub fn change_count(&self) -> usize {
        self.added.len() + self.removed.len()
    }

    /// Short summary such as `+2 -1 =5`, or `No changes`.
    pub fn summary(&self) -> String {
        if !self.has_changes() {
            return "No changes".to_string();
        }

        let mut parts = Vec::new();
        if !self.added.is_empty() {
            parts.push(format!("+{}", self.added.len()));
        }
        if !self.removed.is_empty() {
            parts.push(format!("-{}", self.removed.len()));
        }
        if !self.common.is_empty() {
            parts.push(format!("={}", self.common.len()));
        }
        parts.join(" ")
    }
}

fn clean_set(urls: &[String]) -> BTreeSet<&str> {
    urls.iter()
        .map(|u| u.trim())
        .filter(|u| !u.is_empty())
        .collect()
}

/// Calculate the diff between previous and current URL lists.
///
/// URLs are trimmed and blanks ignored; order and duplicates do not matter.
pub fn calculate_diff(previous: &[String], current: &[String]) -> UrlDiff {
    let prev = clean_set(previous);
    let curr = clean_set(current);

    let to_vec = |set: BTreeSet<&&str>| set.into_iter().map(|s| s.to_string()).collect();

    UrlDiff {
        added: to_vec(curr.difference(&prev).collect()),
        removed: to_vec(prev.difference(&curr).collect()),
        common: to_vec(prev.intersection(&curr).collect()),
    }
}
