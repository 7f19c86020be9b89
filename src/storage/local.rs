//! Local filesystem object store.
//!
//! Object keys map to paths under a root directory. Writes go to a temporary
//! file first and are renamed into place, so a reader never observes a
//! half-written artifact.
//!
//! ## Storage Layout
//!
//! ```text
//! {root}/
//! └── {output_prefix}/
//!     └── collages/
//!         └── {creator}_collage_{hash12}.jpg
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};
use crate::models::{ArtifactMetadata, content_type_for};
use crate::storage::ObjectStore;

const TMP_SUFFIX: &str = ".tmp";

/// Local filesystem object store.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root_dir: PathBuf,
}

impl LocalObjectStore {
    /// Create a new store rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// Get the full path for a key.
    fn path(&self, key: &str) -> PathBuf {
        self.root_dir.join(key.trim_start_matches('/'))
    }

    /// Ensure parent directory exists.
    async fn ensure_dir(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Write bytes atomically (write to temp, then rename).
    async fn write_bytes(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(key);
        self.ensure_dir(&path).await?;

        let mut tmp = path.clone().into_os_string();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Key for a path below the root, with `/` separators.
    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root_dir).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }

    async fn metadata_for(&self, key: &str, path: &Path) -> Result<Option<ArtifactMetadata>> {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AppError::Io(e)),
        };
        let last_modified: DateTime<Utc> = meta.modified()?.into();
        Ok(Some(ArtifactMetadata {
            key: key.to_string(),
            size: meta.len(),
            last_modified,
            content_type: Some(content_type_for(key).to_string()),
        }))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        self.write_bytes(key, &bytes).await?;
        log::debug!(
            "Wrote {} bytes ({}) to {}",
            bytes.len(),
            content_type,
            self.path(key).display()
        );
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<Option<ArtifactMetadata>> {
        self.metadata_for(key, &self.path(key)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ArtifactMetadata>> {
        // Walk from the deepest directory the prefix fully names
        let start = match prefix.rfind('/') {
            Some(index) => self.path(&prefix[..index]),
            None => self.root_dir.clone(),
        };

        let mut found = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(AppError::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Some(key) = self.key_for(&path) else {
                    continue;
                };
                if key.ends_with(TMP_SUFFIX) || !key.starts_with(prefix) {
                    continue;
                }
                if let Some(meta) = self.metadata_for(&key, &path).await? {
                    found.push(meta);
                }
            }
        }

        found.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(found)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    async fn presigned_url(&self, key: &str, _ttl: Duration) -> Result<String> {
        let path = self.path(key);
        if tokio::fs::metadata(&path).await.is_err() {
            return Err(AppError::not_found(key.to_string()));
        }
        Ok(format!("file://{}", path.display()))
    }

    fn location(&self) -> String {
        self.root_dir.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_and_head() {
        let tmp = TempDir::new().unwrap();
        let store = LocalObjectStore::new(tmp.path());

        store
            .put("out/collages/jane_collage_abc.jpg", vec![7; 42], "image/jpeg")
            .await
            .unwrap();
        let meta = store
            .head("out/collages/jane_collage_abc.jpg")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.size, 42);
        assert_eq!(meta.content_type.as_deref(), Some("image/jpeg"));
    }

    #[tokio::test]
    async fn test_head_nonexistent() {
        let tmp = TempDir::new().unwrap();
        let store = LocalObjectStore::new(tmp.path());
        assert!(store.head("nope.jpg").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_by_prefix_and_delete() {
        let tmp = TempDir::new().unwrap();
        let store = LocalObjectStore::new(tmp.path());
        for key in [
            "out/collages/jane_collage_1.jpg",
            "out/collages/jane_collage_2.jpg",
            "out/collages/john_collage_3.jpg",
        ] {
            store.put(key, vec![0; 8], "image/jpeg").await.unwrap();
        }

        let listed = store.list("out/collages/jane_collage_").await.unwrap();
        let keys: Vec<&str> = listed.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["out/collages/jane_collage_1.jpg", "out/collages/jane_collage_2.jpg"]
        );

        store.delete("out/collages/jane_collage_1.jpg").await.unwrap();
        store.delete("out/collages/jane_collage_1.jpg").await.unwrap();
        assert_eq!(store.list("out/collages/").await.unwrap().len(), 2);
        assert!(store.list("missing/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_presigned_url_requires_object() {
        let tmp = TempDir::new().unwrap();
        let store = LocalObjectStore::new(tmp.path());
        assert!(store.presigned_url("a.jpg", Duration::from_secs(60)).await.is_err());
        store.put("a.jpg", vec![1], "image/jpeg").await.unwrap();
        let url = store.presigned_url("a.jpg", Duration::from_secs(60)).await.unwrap();
        assert!(url.starts_with("file://"));
    }
}
