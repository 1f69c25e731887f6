//! Build layer cache.
//!
//! Each layer-producing build step is keyed by a chain hash over its
//! parent key, its instruction text and, for COPY, the digest of the
//! copied content. A step whose key is present reuses the cached layer
//! instead of executing.
//!
//! Entries live under `cache_dir/<key>.tar.gz` with metadata alongside as
//! `<key>.meta.json`.

use std::path::{Path, PathBuf};

use relaybox_core::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::layer::LayerInfo;

/// Metadata for a cached build layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMeta {
    /// Cache key (hex)
    pub key: String,
    /// Layer blob digest (hex, no prefix)
    pub digest: String,
    /// Uncompressed layer digest (hex, no prefix)
    pub diff_id: String,
    /// Instruction that produced the layer
    pub created_by: String,
    /// Size of the layer blob in bytes
    pub size_bytes: u64,
    /// When this layer was cached (Unix timestamp)
    pub cached_at: i64,
    /// Last time this layer was used (Unix timestamp)
    pub last_accessed: i64,
}

/// Chain a step's cache key from its parent.
pub fn cache_key(parent: &str, instruction: &str, content_digest: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent.as_bytes());
    hasher.update([0u8]);
    hasher.update(instruction.as_bytes());
    if let Some(content) = content_digest {
        hasher.update([0u8]);
        hasher.update(content.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// On-disk cache of build step layers.
pub struct BuildCache {
    cache_dir: PathBuf,
}

impl BuildCache {
    /// Open (or create) a build cache at the given directory.
    pub fn new(cache_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(cache_dir).map_err(|e| {
            RelayError::CacheError(format!(
                "Failed to create build cache directory {}: {}",
                cache_dir.display(),
                e
            ))
        })?;

        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.cache_dir
    }

    fn layer_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.tar.gz", key))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.meta.json", key))
    }

    /// Look up a cached layer by key.
    ///
    /// Returns `None` on a miss or when the entry is incomplete or corrupt.
    pub fn get(&self, key: &str) -> Result<Option<LayerInfo>> {
        let layer_path = self.layer_path(key);
        let meta_path = self.meta_path(key);

        if !layer_path.is_file() || !meta_path.is_file() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&meta_path)?;
        let mut meta: CacheMeta = match serde_json::from_str(&content) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Ignoring corrupt build cache entry");
                return Ok(None);
            }
        };

        meta.last_accessed = chrono::Utc::now().timestamp();
        let _ = std::fs::write(&meta_path, serde_json::to_string_pretty(&meta)?);

        Ok(Some(LayerInfo {
            path: layer_path,
            digest: meta.digest,
            diff_id: meta.diff_id,
            size: meta.size_bytes,
        }))
    }

    /// Store a layer under `key`. Returns the cached copy.
    pub fn put(&self, key: &str, layer: &LayerInfo, created_by: &str) -> Result<LayerInfo> {
        let layer_path = self.layer_path(key);
        let meta_path = self.meta_path(key);

        // Copy under a temporary name so readers never see a partial blob
        let tmp_path = self.cache_dir.join(format!("{}.tar.gz.tmp", key));
        std::fs::copy(&layer.path, &tmp_path).map_err(|e| {
            RelayError::CacheError(format!(
                "Failed to copy layer into cache {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        std::fs::rename(&tmp_path, &layer_path).map_err(|e| {
            RelayError::CacheError(format!(
                "Failed to commit cache entry {}: {}",
                layer_path.display(),
                e
            ))
        })?;

        let now = chrono::Utc::now().timestamp();
        let meta = CacheMeta {
            key: key.to_string(),
            digest: layer.digest.clone(),
            diff_id: layer.diff_id.clone(),
            created_by: created_by.to_string(),
            size_bytes: layer.size,
            cached_at: now,
            last_accessed: now,
        };
        std::fs::write(&meta_path, serde_json::to_string_pretty(&meta)?).map_err(|e| {
            RelayError::CacheError(format!(
                "Failed to write cache metadata {}: {}",
                meta_path.display(),
                e
            ))
        })?;

        tracing::debug!(
            key = %key,
            digest = %layer.digest,
            size_bytes = layer.size,
            "Cached build layer"
        );

        Ok(LayerInfo {
            path: layer_path,
            digest: layer.digest.clone(),
            diff_id: layer.diff_id.clone(),
            size: layer.size,
        })
    }

    /// Remove a cached entry by key.
    pub fn invalidate(&self, key: &str) -> Result<()> {
        for path in [self.layer_path(key), self.meta_path(key)] {
            if path.exists() {
                std::fs::remove_file(&path).map_err(|e| {
                    RelayError::CacheError(format!(
                        "Failed to remove cache entry {}: {}",
                        path.display(),
                        e
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Prune the cache to stay within the given byte limit.
    ///
    /// Evicts least-recently-accessed entries first. Returns the number of
    /// entries evicted.
    pub fn prune(&self, max_bytes: u64) -> Result<usize> {
        let mut entries = self.list_entries()?;

        let total_size: u64 = entries.iter().map(|e| e.size_bytes).sum();
        if total_size <= max_bytes {
            return Ok(0);
        }

        entries.sort_by_key(|e| e.last_accessed);

        let mut current_size = total_size;
        let mut evicted = 0;

        for entry in &entries {
            if current_size <= max_bytes {
                break;
            }
            self.invalidate(&entry.key)?;
            current_size = current_size.saturating_sub(entry.size_bytes);
            evicted += 1;

            tracing::debug!(
                key = %entry.key,
                size_bytes = entry.size_bytes,
                "Evicted cached build layer"
            );
        }

        Ok(evicted)
    }

    /// List all cache entries with their metadata.
    pub fn list_entries(&self) -> Result<Vec<CacheMeta>> {
        let read_dir = std::fs::read_dir(&self.cache_dir).map_err(|e| {
            RelayError::CacheError(format!(
                "Failed to read cache directory {}: {}",
                self.cache_dir.display(),
                e
            ))
        })?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| {
                RelayError::CacheError(format!("Failed to read directory entry: {}", e))
            })?;
            let path = entry.path();
            let is_meta = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(".meta.json"))
                .unwrap_or(false);
            if !is_meta {
                continue;
            }
            if let Ok(content) = std::fs::read_to_string(&path) {
                if let Ok(meta) = serde_json::from_str::<CacheMeta>(&content) {
                    entries.push(meta);
                }
            }
        }

        Ok(entries)
    }

    /// Total size of all cached layers in bytes.
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.list_entries()?.iter().map(|e| e.size_bytes).sum())
    }
}
