// src/pipeline/fingerprint.rs

//! Deterministic content fingerprints.
//!
//! A fingerprint is a hex digest over the canonical JSON encoding of
//! `{creator_name, image_urls, url_count, metadata}`, where the
//! creator name is normalized and the URLs are trimmed, deduplicated and
//! sorted. Equal inputs hash identically regardless of URL order or of the
//! order config fields were supplied in.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256, Sha512};

use crate::error::{AppError, Result};
use crate::models::{Creator, CreatorMap, ProcessingConfig, normalize_creator, sanitize_creator};
use crate::pipeline::diff::{UrlDiff, calculate_diff};
use crate::utils::to_canonical_json;

/// Number of fingerprint characters embedded in artifact names.
pub const ARTIFACT_HASH_PREFIX_LEN: usize = 12;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// Length of the lowercase hex encoding.
    pub fn hex_len(&self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(AppError::config(format!(
                "unsupported hash algorithm '{other}' (expected sha256 or sha512)"
            ))),
        }
    }
}

/// Description of the active digest.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HashInfo {
    pub algorithm: String,
    pub hash_length: usize,
}

/// Result of comparing two URL lists for one creator.
#[derive(Debug, Clone, Serialize)]
pub struct ContentComparison {
    pub creator: String,
    pub content_changed: bool,
    pub old_hash: String,
    pub new_hash: String,
    pub old_count: usize,
    pub new_count: usize,
    pub diff: UrlDiff,
    pub change_summary: String,
}

#[derive(Serialize)]
struct FingerprintInput<'a> {
    creator_name: String,
    image_urls: &'a [String],
    url_count: usize,
    /// Serialized name is part of every stored fingerprint
    metadata: &'a Value,
}

#[derive(Serialize)]
struct UrlSetInput<'a> {
    urls: &'a [String],
    count: usize,
}

#[derive(Serialize)]
struct BatchInput<'a> {
    creator_count: usize,
    total_urls: usize,
    creator_hashes: &'a Map<String, Value>,
}

/// Computes fingerprints with a fixed digest algorithm.
#[derive(Debug, Clone)]
pub struct ContentFingerprinter {
    algorithm: HashAlgorithm,
}

impl Default for ContentFingerprinter {
    fn default() -> Self {
        Self {
            algorithm: HashAlgorithm::Sha256,
        }
    }
}

impl ContentFingerprinter {
    /// Create a fingerprinter. Unknown algorithm names fail here.
    pub fn new(algorithm: &str) -> Result<Self> {
        let algorithm = algorithm.parse()?;
        log::debug!("Fingerprinter using {}", algorithm);
        Ok(Self { algorithm })
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    fn hash_hex(&self, data: &[u8]) -> String {
        hex::encode(self.algorithm.digest(data))
    }

    fn hash_canonical<T: Serialize>(&self, value: &T) -> Result<String> {
        Ok(self.hash_hex(to_canonical_json(value)?.as_bytes()))
    }

    /// Fingerprint a creator's URLs under a typed processing config.
    ///
    /// `None` hashes as an empty config object.
    pub fn fingerprint(
        &self,
        creator: &str,
        urls: &[String],
        config: Option<&ProcessingConfig>,
    ) -> Result<String> {
        let params = match config {
            Some(config) => serde_json::to_value(config)?,
            None => Value::Object(Map::new()),
        };
        self.fingerprint_with_params(creator, urls, &params)
    }

    /// Fingerprint a creator's URLs under arbitrary JSON parameters.
    pub fn fingerprint_with_params(
        &self,
        creator: &str,
        urls: &[String],
        params: &Value,
    ) -> Result<String> {
        let image_urls = Creator::new(creator, urls.to_vec()).hash_urls();
        let input = FingerprintInput {
            creator_name: normalize_creator(creator),
            url_count: image_urls.len(),
            image_urls: &image_urls,
            metadata: params,
        };
        let fingerprint = self.hash_canonical(&input)?;
        log::trace!(
            "Fingerprint for {}: {}",
            input.creator_name,
            &fingerprint[..16]
        );
        Ok(fingerprint)
    }

    /// Order-independent hash of a URL set alone.
    pub fn url_set_fingerprint(&self, urls: &[String]) -> Result<String> {
        let urls = Creator::new("", urls.to_vec()).hash_urls();
        self.hash_canonical(&UrlSetInput {
            count: urls.len(),
            urls: &urls,
        })
    }

    /// Hash over every creator's fingerprint in a work list.
    pub fn batch_fingerprint(&self, creators: &CreatorMap) -> Result<String> {
        let mut creator_hashes = Map::new();
        for (name, urls) in creators {
            creator_hashes.insert(name.clone(), Value::String(self.fingerprint(name, urls, None)?));
        }
        let fingerprint = self.hash_canonical(&BatchInput {
            creator_count: creators.len(),
            total_urls: creators.values().map(Vec::len).sum(),
            creator_hashes: &creator_hashes,
        })?;
        log::info!(
            "Batch fingerprint for {} creators: {}",
            creators.len(),
            &fingerprint[..16]
        );
        Ok(fingerprint)
    }

    /// Compare a creator's previous and current URLs.
    pub fn compare(
        &self,
        creator: &str,
        old_urls: &[String],
        new_urls: &[String],
    ) -> Result<ContentComparison> {
        let old_hash = self.fingerprint(creator, old_urls, None)?;
        let new_hash = self.fingerprint(creator, new_urls, None)?;
        let diff = calculate_diff(old_urls, new_urls);

        let comparison = ContentComparison {
            creator: creator.to_string(),
            content_changed: old_hash != new_hash,
            old_count: diff.removed.len() + diff.common.len(),
            new_count: diff.added.len() + diff.common.len(),
            change_summary: diff.summary(),
            old_hash,
            new_hash,
            diff,
        };
        log::info!("Content comparison for {}: {}", creator, comparison.change_summary);
        Ok(comparison)
    }

    /// Whether `hash` looks like a digest from this algorithm.
    pub fn validate_hash(&self, hash: &str) -> bool {
        hash.len() == self.algorithm.hex_len() && hash.chars().all(|c| c.is_ascii_hexdigit())
    }

    pub fn info(&self) -> HashInfo {
        HashInfo {
            algorithm: self.algorithm.as_str().to_string(),
            hash_length: self.algorithm.hex_len(),
        }
    }

    /// Stable 32-bit bucket for a normalized identity: the first four digest
    /// bytes read big-endian.
    pub fn bucket_hash(&self, identity: &str) -> u32 {
        let digest = self.algorithm.digest(identity.as_bytes());
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
    }
}

/// Deterministic artifact file name: `{sanitized}_collage_{hash12}.{ext}`.
pub fn artifact_name(creator: &str, fingerprint: &str, extension: &str) -> String {
    let prefix: String = fingerprint.chars().take(ARTIFACT_HASH_PREFIX_LEN).collect();
    format!(
        "{}_collage_{}.{}",
        sanitize_creator(creator),
        prefix,
        extension.trim_start_matches('.')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_unsupported_algorithm_rejected_at_construction() {
        assert!(matches!(
            ContentFingerprinter::new("md5"),
            Err(AppError::Config(_))
        ));
        assert!(ContentFingerprinter::new("SHA512").is_ok());
    }

    #[test]
    fn test_fingerprint_ignores_url_order_and_duplicates() {
        let fp = ContentFingerprinter::default();
        let a = fp
            .fingerprint("Jane Doe", &urls(&["http://a/1.jpg", "http://a/2.jpg"]), None)
            .unwrap();
        let b = fp
            .fingerprint(
                "  jane doe",
                &urls(&["http://a/2.jpg", " ", "http://a/1.jpg", "http://a/1.jpg "]),
                None,
            )
            .unwrap();
        assert_eq!(a, b);
        assert!(fp.validate_hash(&a));
    }

    #[test]
    fn test_config_key_order_does_not_matter() {
        let fp = ContentFingerprinter::default();
        let list = urls(&["http://a/1.jpg", "http://a/2.jpg"]);
        let first: Value = serde_json::from_str(r#"{"rows":2,"cols":2,"quality":90}"#).unwrap();
        let second: Value = serde_json::from_str(r#"{"quality":90,"cols":2,"rows":2}"#).unwrap();

        let a = fp.fingerprint_with_params("Jane Doe", &list, &first).unwrap();
        let b = fp.fingerprint_with_params("Jane Doe", &list, &second).unwrap();
        assert_eq!(a, b);

        let changed = urls(&["http://a/1.jpg", "http://a/3.jpg"]);
        let c = fp.fingerprint_with_params("Jane Doe", &changed, &first).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_fingerprint_matches_known_digest() {
        let fp = ContentFingerprinter::default();
        let list = urls(&["http://a/1.jpg", "http://a/2.jpg"]);
        let params: Value = serde_json::from_str(r#"{"rows":2,"cols":2,"quality":90}"#).unwrap();
        assert_eq!(
            fp.fingerprint_with_params("Jane Doe", &list, &params).unwrap(),
            "58a0372280fea357ca378b0315fd713f85dd1d19b9724b60f5668b9e6a7d7e58"
        );
        assert_eq!(
            fp.fingerprint("Jane Doe", &list, None).unwrap(),
            "cc447f2d20072b74eac84cf1d3bb62f930cb7bf870a0faa2a226ff69e87999e1"
        );
    }

    #[test]
    fn test_config_changes_fingerprint() {
        let fp = ContentFingerprinter::default();
        let list = urls(&["http://a/1.jpg"]);
        let base = ProcessingConfig::default();
        let tweaked = ProcessingConfig {
            quality: 80,
            ..ProcessingConfig::default()
        };
        assert_ne!(
            fp.fingerprint("x", &list, Some(&base)).unwrap(),
            fp.fingerprint("x", &list, Some(&tweaked)).unwrap()
        );
        assert_ne!(
            fp.fingerprint("x", &list, Some(&base)).unwrap(),
            fp.fingerprint("x", &list, None).unwrap()
        );
    }

    #[test]
    fn test_sha512_length() {
        let fp = ContentFingerprinter::new("sha512").unwrap();
        let hash = fp.url_set_fingerprint(&urls(&["u"])).unwrap();
        assert_eq!(hash.len(), 128);
        assert!(fp.validate_hash(&hash));
        assert!(!ContentFingerprinter::default().validate_hash(&hash));
        assert_eq!(fp.info().hash_length, 128);
    }

    #[test]
    fn test_url_set_fingerprint_order_independent() {
        let fp = ContentFingerprinter::default();
        assert_eq!(
            fp.url_set_fingerprint(&urls(&["b", "a"])).unwrap(),
            fp.url_set_fingerprint(&urls(&["a", "b", "a"])).unwrap()
        );
    }

    #[test]
    fn test_batch_fingerprint_depends_on_members() {
        let fp = ContentFingerprinter::default();
        let mut map = CreatorMap::new();
        map.insert("a".into(), urls(&["1"]));
        let one = fp.batch_fingerprint(&map).unwrap();
        map.insert("b".into(), urls(&["2"]));
        let two = fp.batch_fingerprint(&map).unwrap();
        assert_ne!(one, two);
    }

    #[test]
    fn test_compare_reports_changes() {
        let fp = ContentFingerprinter::default();
        let result = fp
            .compare("Jane", &urls(&["a", "b", "c"]), &urls(&["b", "c", "d", "e"]))
            .unwrap();
        assert!(result.content_changed);
        assert_eq!(result.old_count, 3);
        assert_eq!(result.new_count, 4);
        assert_eq!(result.change_summary, "+2 -1 =2");

        let same = fp.compare("Jane", &urls(&["a"]), &urls(&["a"])).unwrap();
        assert!(!same.content_changed);
        assert_eq!(same.change_summary, "No changes");
    }

    #[test]
    fn test_artifact_name() {
        let name = artifact_name("Jane Doe!", "0123456789abcdef", "jpg");
        assert_eq!(name, "jane_doe_collage_0123456789ab.jpg");
    }

    #[test]
    fn test_bucket_hash_stable() {
        let fp = ContentFingerprinter::default();
        assert_eq!(fp.bucket_hash("jane doe"), fp.bucket_hash("jane doe"));
        // sha256("a") starts with ca978112
        assert_eq!(fp.bucket_hash("a"), 0xca97_8112);
    }
}
