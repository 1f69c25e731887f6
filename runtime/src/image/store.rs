//! Disk-based image store.
//!
//! Built images live as OCI layouts under `sha256/<hex>/` with an
//! in-memory index backed by a persistent `index.json`. Images enter the
//! store only through `put`, which moves a complete layout into place in
//! a single rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use relaybox_core::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Metadata for a stored image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredImage {
    /// Image reference (e.g., "relay:1.0")
    pub reference: String,
    /// Manifest digest (e.g., "sha256:abc123...")
    pub digest: String,
    /// Total size in bytes
    pub size_bytes: u64,
    /// When the image was built
    pub built_at: DateTime<Utc>,
    /// When the image was last used
    pub last_used: DateTime<Utc>,
    /// Path to the OCI image layout on disk
    pub path: PathBuf,
}

/// Persistent index stored as JSON on disk.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    images: Vec<StoredImage>,
}

/// Disk-based image store with in-memory index and LRU eviction.
pub struct ImageStore {
    store_dir: PathBuf,
    /// reference → StoredImage
    index: Arc<RwLock<HashMap<String, StoredImage>>>,
    max_size_bytes: u64,
}

impl ImageStore {
    /// Open (or create) an image store and load its index.
    pub fn new(store_dir: &Path, max_size_bytes: u64) -> Result<Self> {
        std::fs::create_dir_all(store_dir.join("sha256")).map_err(|e| {
            RelayError::OciImageError(format!(
                "Failed to create image store directory {}: {}",
                store_dir.display(),
                e
            ))
        })?;

        let index = Self::load_index(store_dir)?;
        Ok(Self {
            store_dir: store_dir.to_path_buf(),
            index: Arc::new(RwLock::new(index)),
            max_size_bytes,
        })
    }

    /// Get a stored image by reference.
    pub async fn get(&self, reference: &str) -> Option<StoredImage> {
        let mut index = self.index.write().await;
        let image = index.get_mut(reference)?;
        image.last_used = Utc::now();
        let updated = image.clone();
        drop(index);
        self.save_access_time().await;
        Some(updated)
    }

    /// Get a stored image by digest. Accepts a unique hex prefix.
    pub async fn get_by_digest(&self, digest: &str) -> Option<StoredImage> {
        let wanted = digest.strip_prefix("sha256:").unwrap_or(digest);
        if wanted.is_empty() {
            return None;
        }
        let mut index = self.index.write().await;
        let mut matches = index.values_mut().filter(|img| {
            img.digest
                .strip_prefix("sha256:")
                .unwrap_or(&img.digest)
                .starts_with(wanted)
        });
        let image = matches.next()?;
        let digest_of_first = image.digest.clone();
        image.last_used = Utc::now();
        let updated = image.clone();
        // Ambiguous prefix across different images: no match
        if matches.any(|other| other.digest != digest_of_first) {
            return None;
        }
        drop(index);
        self.save_access_time().await;
        Some(updated)
    }

    /// Resolve a reference or digest to a stored image.
    pub async fn resolve(&self, reference_or_digest: &str) -> Option<StoredImage> {
        match self.get(reference_or_digest).await {
            Some(image) => Some(image),
            None => self.get_by_digest(reference_or_digest).await,
        }
    }

    /// Store a complete OCI layout from `source_dir` under `reference`.
    ///
    /// The layout is staged next to its final location and renamed into
    /// `sha256/<hex>/`, so a reader never observes a partial image.
    pub async fn put(&self, reference: &str, digest: &str, source_dir: &Path) -> Result<StoredImage> {
        let digest_hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        if digest_hex.is_empty() || !digest_hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(RelayError::OciImageError(format!(
                "Invalid image digest: {}",
                digest
            )));
        }
        let target_dir = self.store_dir.join("sha256").join(digest_hex);

        if !target_dir.exists() {
            let staging = self
                .store_dir
                .join("sha256")
                .join(format!(".{}.partial-{}", digest_hex, std::process::id()));
            let src = source_dir.to_path_buf();
            let staging_clone = staging.clone();
            let target_clone = target_dir.clone();
            tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                if staging_clone.exists() {
                    std::fs::remove_dir_all(&staging_clone)?;
                }
                copy_dir_recursive(&src, &staging_clone)?;
                std::fs::rename(&staging_clone, &target_clone)
            })
            .await
            .map_err(|e| RelayError::OciImageError(format!("Store task failed: {}", e)))?
            .map_err(|e| {
                let _ = std::fs::remove_dir_all(&staging);
                RelayError::OciImageError(format!("Failed to copy image to store: {}", e))
            })?;
        }

        let size_bytes = dir_size(&target_dir);
        let now = Utc::now();
        let stored = StoredImage {
            reference: reference.to_string(),
            digest: format!("sha256:{}", digest_hex),
            size_bytes,
            built_at: now,
            last_used: now,
            path: target_dir,
        };

        let previous = {
            let mut index = self.index.write().await;
            index.insert(reference.to_string(), stored.clone())
        };
        self.save_index().await?;

        // Retagging leaves the old layout orphaned unless another tag uses it
        if let Some(previous) = previous {
            if previous.digest != stored.digest {
                self.remove_layout_if_unused(&previous).await?;
            }
        }

        tracing::info!(
            reference = %reference,
            digest = %stored.digest,
            size_bytes,
            "Stored image"
        );

        Ok(stored)
    }

    /// Remove an image by reference or digest.
    ///
    /// The layout directory is deleted once no other reference points to
    /// the same digest.
    pub async fn remove(&self, reference_or_digest: &str) -> Result<StoredImage> {
        let key = {
            let index = self.index.read().await;
            if index.contains_key(reference_or_digest) {
                Some(reference_or_digest.to_string())
            } else {
                let wanted = reference_or_digest
                    .strip_prefix("sha256:")
                    .unwrap_or(reference_or_digest);
                let found: Vec<&StoredImage> = index
                    .values()
                    .filter(|img| {
                        !wanted.is_empty()
                            && img
                                .digest
                                .strip_prefix("sha256:")
                                .unwrap_or(&img.digest)
                                .starts_with(wanted)
                    })
                    .collect();
                match found.as_slice() {
                    [one] => Some(one.reference.clone()),
                    _ => None,
                }
            }
        };

        let key = key.ok_or_else(|| {
            RelayError::OciImageError(format!("Image not found: {}", reference_or_digest))
        })?;

        let image = {
            let mut index = self.index.write().await;
            index.remove(&key)
        }
        .ok_or_else(|| RelayError::OciImageError(format!("Image not found: {}", key)))?;

        self.save_index().await?;
        self.remove_layout_if_unused(&image).await?;
        Ok(image)
    }

    async fn remove_layout_if_unused(&self, image: &StoredImage) -> Result<()> {
        let still_used = {
            let index = self.index.read().await;
            index.values().any(|img| img.digest == image.digest)
        };
        if !still_used && image.path.exists() {
            std::fs::remove_dir_all(&image.path).map_err(|e| {
                RelayError::OciImageError(format!(
                    "Failed to remove image directory {}: {}",
                    image.path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// All stored images, sorted by reference.
    pub async fn list(&self) -> Vec<StoredImage> {
        let index = self.index.read().await;
        let mut images: Vec<StoredImage> = index.values().cloned().collect();
        images.sort_by(|a, b| a.reference.cmp(&b.reference));
        images
    }

    /// Evict least-recently-used images until the store fits its limit.
    ///
    /// Returns the references of evicted images.
    pub async fn evict(&self) -> Result<Vec<String>> {
        let mut evicted = Vec::new();
        while self.total_size().await > self.max_size_bytes {
            let lru = {
                let index = self.index.read().await;
                index
                    .values()
                    .min_by_key(|img| img.last_used)
                    .map(|img| img.reference.clone())
            };
            match lru {
                Some(reference) => {
                    self.remove(&reference).await?;
                    tracing::debug!(reference = %reference, "Evicted image");
                    evicted.push(reference);
                }
                None => break,
            }
        }
        Ok(evicted)
    }

    /// Total size of all stored images in bytes, counting shared layouts once.
    pub async fn total_size(&self) -> u64 {
        let index = self.index.read().await;
        let mut seen = std::collections::HashSet::new();
        index
            .values()
            .filter(|img| seen.insert(img.digest.clone()))
            .map(|img| img.size_bytes)
            .sum()
    }

    fn load_index(store_dir: &Path) -> Result<HashMap<String, StoredImage>> {
        let index_path = store_dir.join("index.json");
        if !index_path.exists() {
            return Ok(HashMap::new());
        }

        let data = std::fs::read_to_string(&index_path).map_err(|e| {
            RelayError::OciImageError(format!(
                "Failed to read image store index {}: {}",
                index_path.display(),
                e
            ))
        })?;
        let store_index: StoreIndex = serde_json::from_str(&data).map_err(|e| {
            RelayError::OciImageError(format!("Failed to parse image store index: {}", e))
        })?;

        Ok(store_index
            .images
            .into_iter()
            .filter(|image| image.path.exists())
            .map(|image| (image.reference.clone(), image))
            .collect())
    }

    /// Persist a `last_used` update. A lookup still succeeds when this fails.
    async fn save_access_time(&self) {
        if let Err(e) = self.save_index().await {
            tracing::warn!(
                store = %self.store_dir.display(),
                error = %e,
                "Failed to persist image access time"
            );
        }
    }

    async fn save_index(&self) -> Result<()> {
        let store_index = {
            let index = self.index.read().await;
            let mut images: Vec<StoredImage> = index.values().cloned().collect();
            images.sort_by(|a, b| a.reference.cmp(&b.reference));
            StoreIndex { images }
        };

        let data = serde_json::to_string_pretty(&store_index)?;
        let index_path = self.store_dir.join("index.json");
        let tmp_path = self.store_dir.join("index.json.tmp");

        tokio::fs::write(&tmp_path, data).await.map_err(|e| {
            RelayError::OciImageError(format!(
                "Failed to write image store index {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        tokio::fs::rename(&tmp_path, &index_path).await.map_err(|e| {
            RelayError::OciImageError(format!(
                "Failed to write image store index {}: {}",
                index_path.display(),
                e
            ))
        })?;

        Ok(())
    }

    /// Get the store directory path.
    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            std::fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                total += dir_size(&path);
            } else if let Ok(meta) = path.metadata() {
                total += meta.len();
            }
        }
    }
    total
}
