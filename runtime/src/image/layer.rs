//! Layer creation and extraction.
//!
//! Layers are gzip-compressed tarballs written deterministically: entries
//! are sorted, headers use fixed mtime/uid/gid, and the gzip header carries
//! no timestamp or file name. Identical inputs always hash to the same
//! digest.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use relaybox_core::error::{RelayError, Result};
use sha2::{Digest, Sha256};

/// Metadata for a single file in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    /// Relative path from rootfs root
    pub path: PathBuf,
    /// File size in bytes
    pub size: u64,
    /// Modification time (nanoseconds since epoch)
    pub mtime: i128,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// A snapshot of a directory's file state.
#[derive(Debug, Clone, Default)]
pub struct DirSnapshot {
    /// Map of relative path → file entry
    pub entries: HashMap<PathBuf, FileEntry>,
}

impl DirSnapshot {
    /// Take a snapshot of a directory, recording all files and their metadata.
    pub fn capture(root: &Path) -> Result<Self> {
        let mut entries = HashMap::new();
        walk_dir(root, root, &mut entries)?;
        Ok(DirSnapshot { entries })
    }

    /// Paths added or modified between `self` (before) and `after`, sorted.
    ///
    /// A directory that already existed is not reported when only its
    /// mtime moved; its new children are, and extraction recreates it.
    pub fn diff(&self, after: &DirSnapshot) -> Vec<PathBuf> {
        let mut changed: Vec<PathBuf> = after
            .entries
            .iter()
            .filter(|(path, after_entry)| match self.entries.get(*path) {
                None => true,
                Some(before) if before.is_dir && after_entry.is_dir => false,
                Some(before) => {
                    before.size != after_entry.size
                        || before.mtime != after_entry.mtime
                        || before.is_dir != after_entry.is_dir
                }
            })
            .map(|(path, _)| path.clone())
            .collect();
        changed.sort();
        changed
    }
}

fn walk_dir(root: &Path, current: &Path, entries: &mut HashMap<PathBuf, FileEntry>) -> Result<()> {
    let read_dir = std::fs::read_dir(current).map_err(|e| {
        RelayError::BuildError(format!(
            "Failed to read directory {}: {}",
            current.display(),
            e
        ))
    })?;

    for entry in read_dir {
        let entry = entry
            .map_err(|e| RelayError::BuildError(format!("Failed to read directory entry: {}", e)))?;
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|e| RelayError::BuildError(format!("Failed to strip prefix: {}", e)))?
            .to_path_buf();

        // symlink_metadata: never follow links out of the rootfs
        let metadata = std::fs::symlink_metadata(&path).map_err(|e| {
            RelayError::BuildError(format!(
                "Failed to read metadata for {}: {}",
                path.display(),
                e
            ))
        })?;

        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i128)
            .unwrap_or(0);

        entries.insert(
            relative.clone(),
            FileEntry {
                path: relative,
                size: metadata.len(),
                mtime,
                is_dir: metadata.is_dir(),
            },
        );

        if metadata.is_dir() {
            walk_dir(root, &path, entries)?;
        }
    }

    Ok(())
}

/// Information about a created layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerInfo {
    /// Path to the layer tar.gz file
    pub path: PathBuf,
    /// SHA256 of the compressed blob (hex, no prefix)
    pub digest: String,
    /// SHA256 of the uncompressed tar (hex, no prefix)
    pub diff_id: String,
    /// Compressed size in bytes
    pub size: u64,
}

impl LayerInfo {
    /// Inspect an existing layer file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let digest = sha256_file(path)?;
        let diff_id = compute_diff_id(path)?;
        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path: path.to_path_buf(),
            digest,
            diff_id,
            size,
        })
    }

    /// Get the digest with "sha256:" prefix.
    pub fn prefixed_digest(&self) -> String {
        format!("sha256:{}", self.digest)
    }
}

/// Write `entries` (tar path → host path) into a deterministic tar.gz.
fn write_layer(entries: &BTreeMap<PathBuf, PathBuf>, output_path: &Path) -> Result<LayerInfo> {
    let file = File::create(output_path).map_err(|e| {
        RelayError::BuildError(format!(
            "Failed to create layer file {}: {}",
            output_path.display(),
            e
        ))
    })?;

    let encoder = GzBuilder::new().mtime(0).write(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.mode(tar::HeaderMode::Deterministic);
    builder.follow_symlinks(false);

    for (tar_path, host_path) in entries {
        let metadata = std::fs::symlink_metadata(host_path).map_err(|e| {
            RelayError::BuildError(format!(
                "Failed to read metadata for {}: {}",
                host_path.display(),
                e
            ))
        })?;
        let result = if metadata.is_dir() {
            builder.append_dir(tar_path, host_path)
        } else {
            builder.append_path_with_name(host_path, tar_path)
        };
        result.map_err(|e| {
            RelayError::BuildError(format!(
                "Failed to add {} to layer: {}",
                tar_path.display(),
                e
            ))
        })?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| RelayError::BuildError(format!("Failed to finalize layer: {}", e)))?;
    let mut file = encoder
        .finish()
        .map_err(|e| RelayError::BuildError(format!("Failed to finalize layer: {}", e)))?;
    file.flush()?;

    LayerInfo::from_file(output_path)
}

/// Create a layer from a list of changed paths in a rootfs.
pub fn create_layer(rootfs: &Path, changed_files: &[PathBuf], output_path: &Path) -> Result<LayerInfo> {
    let entries: BTreeMap<PathBuf, PathBuf> = changed_files
        .iter()
        .map(|relative| (relative.clone(), rootfs.join(relative)))
        .filter(|(_, full)| full.symlink_metadata().is_ok())
        .collect();
    write_layer(&entries, output_path)
}

/// Resolve COPY sources into a sorted map of image path → context path.
///
/// A file source lands at `<target>/<file name>`; a directory source has
/// its contents copied into `<target>`. Missing sources are an error.
pub fn copy_entries(
    context_dir: &Path,
    sources: &[String],
    target_prefix: &Path,
) -> Result<BTreeMap<PathBuf, PathBuf>> {
    let mut entries = BTreeMap::new();
    for source in sources {
        let src_path = context_dir.join(source);
        let metadata = std::fs::metadata(&src_path).map_err(|_| {
            RelayError::BuildError(format!(
                "COPY source not found: {} (in context {})",
                source,
                context_dir.display()
            ))
        })?;

        if metadata.is_dir() {
            collect_dir(&src_path, &src_path, target_prefix, &mut entries)?;
        } else {
            let name = src_path.file_name().ok_or_else(|| {
                RelayError::BuildError(format!("Invalid COPY source: {}", source))
            })?;
            entries.insert(target_prefix.join(name), src_path);
        }
    }
    Ok(entries)
}

fn collect_dir(
    root: &Path,
    current: &Path,
    target_prefix: &Path,
    entries: &mut BTreeMap<PathBuf, PathBuf>,
) -> Result<()> {
    let read_dir = std::fs::read_dir(current).map_err(|e| {
        RelayError::BuildError(format!(
            "Failed to read directory {}: {}",
            current.display(),
            e
        ))
    })?;
    for entry in read_dir {
        let entry = entry.map_err(|e| RelayError::BuildError(format!("Failed to read entry: {}", e)))?;
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|e| RelayError::BuildError(format!("Failed to strip prefix: {}", e)))?;
        entries.insert(target_prefix.join(relative), path.clone());
        if path.is_dir() {
            collect_dir(root, &path, target_prefix, entries)?;
        }
    }
    Ok(())
}

/// Create a layer from files in the build context (used for COPY).
pub fn create_copy_layer(entries: &BTreeMap<PathBuf, PathBuf>, output_path: &Path) -> Result<LayerInfo> {
    write_layer(entries, output_path)
}

/// Digest over the image paths, modes and contents of COPY entries.
pub fn content_digest(entries: &BTreeMap<PathBuf, PathBuf>) -> Result<String> {
    let mut hasher = Sha256::new();
    for (tar_path, host_path) in entries {
        hasher.update(tar_path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        let metadata = std::fs::metadata(host_path)?;
        if metadata.is_dir() {
            hasher.update(b"dir");
        } else {
            hasher.update(if is_executable(&metadata) { b"x" } else { b"-" });
            hasher.update(sha256_file(host_path)?.as_bytes());
        }
        hasher.update([0u8]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}

/// Extract a layer (tar.gz) into a target directory.
pub fn extract_layer(layer_path: &Path, target_dir: &Path) -> Result<()> {
    if !layer_path.exists() {
        return Err(RelayError::OciImageError(format!(
            "Layer file not found: {}",
            layer_path.display()
        )));
    }

    std::fs::create_dir_all(target_dir).map_err(|e| {
        RelayError::OciImageError(format!(
            "Failed to create target directory {}: {}",
            target_dir.display(),
            e
        ))
    })?;

    let file = File::open(layer_path).map_err(|e| {
        RelayError::OciImageError(format!(
            "Failed to open layer file {}: {}",
            layer_path.display(),
            e
        ))
    })?;

    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.unpack(target_dir).map_err(|e| {
        RelayError::OciImageError(format!(
            "Failed to extract layer to {}: {}",
            target_dir.display(),
            e
        ))
    })?;

    tracing::debug!(
        layer = %layer_path.display(),
        target = %target_dir.display(),
        "Extracted layer"
    );

    Ok(())
}

/// SHA256 of the uncompressed layer content.
pub fn compute_diff_id(layer_path: &Path) -> Result<String> {
    let file = File::open(layer_path).map_err(|e| {
        RelayError::BuildError(format!("Failed to read layer for diff_id: {}", e))
    })?;
    let mut decoder = GzDecoder::new(BufReader::new(file));
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = decoder.read(&mut buf).map_err(|e| {
            RelayError::BuildError(format!("Failed to decompress layer for diff_id: {}", e))
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compute SHA256 digest of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| {
        RelayError::BuildError(format!(
            "Failed to read file for hashing {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Compute SHA256 digest of raw bytes.
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
