//! On-disk index of cached bundles
//!
//! The manifest lets a reopened cache recover its entries and aggregate size
//! without re-fetching. It is rewritten atomically (temp file + rename).

use crate::error::Result;
use crate::types::CacheEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs;
use url::Url;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

/// Suffix of files still being written
pub const PARTIAL_SUFFIX: &str = ".partial";

const MAX_EXTENSION_LEN: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub entries: Vec<ManifestRecord>,
}

/// One persisted entry; `file` is relative to the cache directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub key: String,
    pub file: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
}

impl Manifest {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a CacheEntry>) -> Self {
        let mut records: Vec<ManifestRecord> = entries
            .into_iter()
            .filter_map(|entry| {
                let file = entry.path.file_name()?.to_str()?.to_string();
                Some(ManifestRecord {
                    key: entry.key.clone(),
                    file,
                    size: entry.size,
                    created_at: entry.created_at,
                    last_access: entry.last_access,
                })
            })
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));

        Self {
            version: MANIFEST_VERSION,
            entries: records,
        }
    }

    /// Load the manifest from `dir`, `None` if there is none yet
    pub async fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(MANIFEST_FILE);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let manifest: Manifest = serde_json::from_slice(&data)?;
        Ok(Some(manifest))
    }

    pub async fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MANIFEST_FILE);
        let tmp = dir.join(format!("{}{}", MANIFEST_FILE, PARTIAL_SUFFIX));
        let data = serde_json::to_vec_pretty(self)?;
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Hex SHA-256 of a request key
pub fn key_digest(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Extension (with leading dot) taken from the key's URL path, if sensible
pub fn key_extension(key: &str) -> Option<String> {
    let parsed = Url::parse(key).ok();
    let path = parsed.as_ref().map(|u| u.path()).unwrap_or(key);
    let last = path.rsplit('/').next()?;
    let (_, ext) = last.rsplit_once('.')?;
    if ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }
    Some(format!(".{}", ext.to_ascii_lowercase()))
}

/// File name for a materialization of `key`; `unique` separates successive
/// materializations of the same key
pub fn file_name_for(key: &str, unique: &str) -> String {
    format!(
        "{}-{}{}",
        key_digest(key),
        unique,
        key_extension(key).unwrap_or_default()
    )
}
