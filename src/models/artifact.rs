//! Artifact metadata as reported by the object store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Object store view of a produced artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub content_type: Option<String>,
}

impl ArtifactMetadata {
    /// Creator segment of a `{creator}_collage_{hash}.{ext}` key.
    pub fn creator_from_key(&self) -> Option<&str> {
        let file_name = self.key.rsplit('/').next()?;
        file_name.split_once("_collage_").map(|(creator, _)| creator)
    }
}

/// Content type inferred from a key's extension.
pub fn content_type_for(key: &str) -> &'static str {
    let ext = key
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "json" => "application/json",
        "csv" => "text/csv",
        _ => "application/octet-stream",
    }
}
