//! Creator identity and URL list.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Normalize a creator name into its identity: trimmed and lower-cased.
pub fn normalize_creator(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Sanitize a creator name for use inside an object key.
///
/// Keeps alphanumerics, spaces, `-` and `_`, then replaces spaces with `_`
/// and lower-cases the result.
pub fn sanitize_creator(name: &str) -> String {
    let kept: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    kept.trim().replace(' ', "_").to_lowercase()
}

/// A creator and the content URLs attributed to them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Creator {
    /// Display name as supplied by the input
    pub name: String,

    /// Content URLs in input order
    pub urls: Vec<String>,
}

impl Creator {
    pub fn new(name: impl Into<String>, urls: Vec<String>) -> Self {
        Self {
            name: name.into(),
            urls,
        }
    }

    /// Normalized identity used for keys, hashing and batch membership.
    pub fn identity(&self) -> String {
        normalize_creator(&self.name)
    }

    /// URLs for rendering: trimmed, blanks and duplicates dropped, input order kept.
    pub fn render_urls(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.urls
            .iter()
            .map(|u| u.trim())
            .filter(|u| !u.is_empty())
            .filter(|u| seen.insert(*u))
            .map(str::to_string)
            .collect()
    }

    /// URLs for hashing: trimmed, deduplicated and sorted.
    pub fn hash_urls(&self) -> Vec<String> {
        let mut urls = self.render_urls();
        urls.sort();
        urls
    }
}
