//! Reading built images back from their OCI layout.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use oci_spec::image::{ImageConfiguration, ImageIndex, ImageManifest};
use relaybox_core::error::{RelayError, Result};

use super::env::EnvSet;

/// Run configuration of an image.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImageConfig {
    /// Declared environment defaults, in declaration order
    pub env: EnvSet,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub working_dir: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl ImageConfig {
    /// Entrypoint followed by Cmd.
    pub fn command(&self) -> Vec<String> {
        self.entrypoint.iter().chain(self.cmd.iter()).cloned().collect()
    }

    /// Working directory, `/` when unset.
    pub fn workdir(&self) -> &str {
        self.working_dir.as_deref().filter(|w| !w.is_empty()).unwrap_or("/")
    }

    fn from_oci_config(oci_config: &ImageConfiguration) -> Result<Self> {
        let config = oci_config.config().as_ref();

        let entrypoint = config.and_then(|c| c.entrypoint().clone()).unwrap_or_default();
        let cmd = config.and_then(|c| c.cmd().clone()).unwrap_or_default();
        let working_dir = config.and_then(|c| c.working_dir().clone());

        let env = match config.and_then(|c| c.env().as_ref()) {
            Some(list) => EnvSet::from_env_list(list.as_slice())?,
            None => EnvSet::new(),
        };

        let labels = config
            .and_then(|c| c.labels().clone())
            .map(|labels| labels.into_iter().collect())
            .unwrap_or_default();

        Ok(Self {
            env,
            entrypoint,
            cmd,
            working_dir,
            labels,
        })
    }
}

/// An image loaded from an OCI layout on disk.
#[derive(Debug)]
pub struct OciImage {
    root_dir: PathBuf,
    manifest_digest: String,
    config: ImageConfig,
    /// Uncompressed layer digests from the config
    diff_ids: Vec<String>,
    /// Layer blobs, bottom to top
    layer_paths: Vec<PathBuf>,
}

impl OciImage {
    /// Load an image from an OCI layout directory.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let root_dir = path.as_ref().to_path_buf();
        validate_oci_layout(&root_dir)?;

        let index: ImageIndex = read_json(&root_dir.join("index.json"), "index.json")?;
        let manifest_digest = index
            .manifests()
            .first()
            .ok_or_else(|| RelayError::OciImageError("No manifests in index.json".to_string()))?
            .digest()
            .to_string();

        let manifest: ImageManifest =
            read_json(&blob_path(&root_dir, &manifest_digest), "manifest")?;
        let oci_config: ImageConfiguration =
            read_json(&blob_path(&root_dir, manifest.config().digest()), "config")?;

        let layer_paths = manifest
            .layers()
            .iter()
            .map(|layer| blob_path(&root_dir, layer.digest()))
            .collect();

        Ok(Self {
            config: ImageConfig::from_oci_config(&oci_config)?,
            diff_ids: oci_config.rootfs().diff_ids().clone(),
            root_dir,
            manifest_digest,
            layer_paths,
        })
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    /// Layer blobs, bottom to top.
    pub fn layer_paths(&self) -> &[PathBuf] {
        &self.layer_paths
    }

    pub fn diff_ids(&self) -> &[String] {
        &self.diff_ids
    }

    pub fn manifest_digest(&self) -> &str {
        &self.manifest_digest
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }
}

fn validate_oci_layout(root_dir: &Path) -> Result<()> {
    for required in ["oci-layout", "index.json", "blobs"] {
        if !root_dir.join(required).exists() {
            return Err(RelayError::OciImageError(format!(
                "Not a valid OCI layout: missing {} in {}",
                required,
                root_dir.display()
            )));
        }
    }
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        RelayError::OciImageError(format!("Failed to read {} at {}: {}", what, path.display(), e))
    })?;
    serde_json::from_str(&content)
        .map_err(|e| RelayError::OciImageError(format!("Failed to parse {}: {}", what, e)))
}

/// Path to a blob by digest ("sha256:abc" → blobs/sha256/abc).
pub(crate) fn blob_path(root_dir: &Path, digest: &str) -> PathBuf {
    let (algorithm, hash) = digest.split_once(':').unwrap_or(("sha256", digest));
    root_dir.join("blobs").join(algorithm).join(hash)
}
