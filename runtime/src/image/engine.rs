//! Build engine.
//!
//! Executes a [`BuildRecipe`] step by step in a temporary staging rootfs,
//! producing one deterministic layer per COPY and RUN step, and commits the
//! assembled OCI layout to the [`ImageStore`] only after every step
//! succeeded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use relaybox_core::error::{RelayError, Result};

use super::cache::{cache_key, BuildCache};
use super::config::OciImage;
use super::dockerfile::Instruction;
use super::env::{resolve_vars, EnvSet};
use super::layer::{
    content_digest, copy_entries, create_copy_layer, create_layer, extract_layer, sha256_bytes,
    DirSnapshot, LayerInfo,
};
use super::manifest::DependencyManifest;
use super::recipe::{resolve_path, BuildRecipe};
use super::runner::{StepContext, StepRunner};
use super::store::ImageStore;

const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// Configuration for a build operation.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Build context directory
    pub context_dir: PathBuf,
    /// Recipe to execute
    pub recipe: BuildRecipe,
    /// Image reference to store the result under
    pub tag: Option<String>,
    /// Build layer cache directory; `None` disables the cache entirely
    pub cache_dir: Option<PathBuf>,
    /// Skip cache lookups (layers are still written to the cache)
    pub no_cache: bool,
    /// Suppress build output
    pub quiet: bool,
}

impl BuildConfig {
    pub fn new(context_dir: impl Into<PathBuf>, recipe: BuildRecipe) -> Self {
        Self {
            context_dir: context_dir.into(),
            recipe,
            tag: None,
            cache_dir: None,
            no_cache: false,
            quiet: true,
        }
    }
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildResult {
    /// Image reference stored in the image store
    pub reference: String,
    /// Manifest digest ("sha256:...")
    pub digest: String,
    /// Total image size in bytes
    pub size: u64,
    /// Number of layers, base layers included
    pub layer_count: usize,
    /// Layer-producing steps served from the build cache
    pub cached_steps: usize,
}

/// Mutable state accumulated during the build.
struct BuildState {
    workdir: String,
    env: EnvSet,
    entrypoint: Vec<String>,
    cmd: Vec<String>,
    labels: BTreeMap<String, String>,
    layers: Vec<LayerInfo>,
    history: Vec<HistoryEntry>,
    /// Chained cache key of the last processed instruction
    key: String,
    cached_steps: usize,
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    created_by: String,
    empty_layer: bool,
}

/// The resolved base runtime.
struct BaseImage {
    layers: Vec<LayerInfo>,
    env: EnvSet,
    workdir: String,
    /// Identity fed into the first cache key
    identity: String,
}

/// Execute a full image build.
///
/// # Process
///
/// 1. Validate the recipe and preflight the build context
/// 2. Resolve the base runtime from the local store
/// 3. Execute each instruction, reusing cached layers where keys match
/// 4. Assemble the OCI image layout
/// 5. Commit it to the store under the requested tag
pub async fn build(
    config: BuildConfig,
    store: Arc<ImageStore>,
    runner: &dyn StepRunner,
) -> Result<BuildResult> {
    let recipe = &config.recipe;
    recipe.validate()?;
    preflight(&config)?;

    let dockerfile = recipe.to_dockerfile();
    let total = dockerfile.instructions.len();
    let reference = config
        .tag
        .clone()
        .unwrap_or_else(|| crate::DEFAULT_IMAGE_TAG.to_string());

    let cache = match &config.cache_dir {
        Some(dir) => Some(BuildCache::new(dir)?),
        None => None,
    };

    let build_dir = tempfile::TempDir::new()
        .map_err(|e| RelayError::BuildError(format!("Failed to create build directory: {}", e)))?;
    let rootfs_dir = build_dir.path().join("rootfs");
    let layers_dir = build_dir.path().join("layers");
    for dir in [&rootfs_dir, &layers_dir] {
        std::fs::create_dir_all(dir).map_err(|e| {
            RelayError::BuildError(format!("Failed to create {}: {}", dir.display(), e))
        })?;
    }

    let base = resolve_base(recipe, &store, &rootfs_dir).await?;

    let mut state = BuildState {
        workdir: base.workdir.clone(),
        env: base.env.clone(),
        entrypoint: Vec::new(),
        cmd: Vec::new(),
        labels: BTreeMap::new(),
        layers: Vec::new(),
        history: Vec::new(),
        key: base.identity.clone(),
        cached_steps: 0,
    };

    for (idx, instruction) in dockerfile.instructions.iter().enumerate() {
        let step = idx + 1;
        let text = instruction.to_string();
        if !config.quiet {
            println!("Step {}/{}: {}", step, total, text);
        }

        match instruction {
            Instruction::From { .. } | Instruction::Arg { .. } => {
                state.key = cache_key(&state.key, &text, None);
                state.history.push(HistoryEntry {
                    created_by: text,
                    empty_layer: true,
                });
            }

            Instruction::Workdir { path } => {
                state.workdir = resolve_path(&state.workdir, path);
                let full = rootfs_dir.join(state.workdir.trim_start_matches('/'));
                std::fs::create_dir_all(&full).map_err(|e| {
                    RelayError::BuildError(format!("Failed to create WORKDIR {}: {}", full.display(), e))
                })?;
                state.key = cache_key(&state.key, &text, None);
                state.history.push(HistoryEntry {
                    created_by: text,
                    empty_layer: true,
                });
            }

            Instruction::Copy { src, dst, .. } => {
                let target = resolve_path(&state.workdir, dst);
                let target_prefix = PathBuf::from(target.trim_start_matches('/'));
                let entries = copy_entries(&config.context_dir, src, &target_prefix)?;
                let content = content_digest(&entries)?;
                let key = cache_key(&state.key, &text, Some(&content));

                let layer = match lookup(cache.as_ref(), &key, config.no_cache)? {
                    Some(layer) => {
                        state.cached_steps += 1;
                        if !config.quiet {
                            println!(" ---> Using cache");
                        }
                        layer
                    }
                    None => {
                        let output = layers_dir.join(format!("layer_{}.tar.gz", step));
                        let layer = blocking(move || create_copy_layer(&entries, &output)).await?;
                        store_in_cache(cache.as_ref(), &key, layer, &text)?
                    }
                };

                apply_layer(&layer, &rootfs_dir).await?;
                state.key = key;
                state.layers.push(layer);
                state.history.push(HistoryEntry {
                    created_by: text,
                    empty_layer: false,
                });
            }

            Instruction::Run { command } => {
                let key = cache_key(&state.key, &text, None);

                let layer = match lookup(cache.as_ref(), &key, config.no_cache)? {
                    Some(layer) => {
                        state.cached_steps += 1;
                        if !config.quiet {
                            println!(" ---> Using cache");
                        }
                        apply_layer(&layer, &rootfs_dir).await?;
                        layer
                    }
                    None => {
                        let layer =
                            run_step(command, &state, &rootfs_dir, &layers_dir, step, runner, config.quiet)
                                .await?;
                        store_in_cache(cache.as_ref(), &key, layer, &text)?
                    }
                };

                state.key = key;
                state.layers.push(layer);
                state.history.push(HistoryEntry {
                    created_by: text,
                    empty_layer: false,
                });
            }

            Instruction::Env { vars } => {
                let resolved: Vec<(String, String)> = vars
                    .iter()
                    .map(|(name, value)| (name.clone(), resolve_vars(value, &state.env)))
                    .collect();
                for (name, value) in resolved {
                    state.env.set(name, value);
                }
                state.key = cache_key(&state.key, &text, None);
                state.history.push(HistoryEntry {
                    created_by: text,
                    empty_layer: true,
                });
            }

            Instruction::Entrypoint { exec } => {
                state.entrypoint = exec.clone();
                state.history.push(HistoryEntry {
                    created_by: text,
                    empty_layer: true,
                });
            }

            Instruction::Cmd { exec } => {
                state.cmd = exec.clone();
                state.history.push(HistoryEntry {
                    created_by: text,
                    empty_layer: true,
                });
            }

            Instruction::Label { key, value } => {
                state.labels.insert(key.clone(), value.clone());
                state.history.push(HistoryEntry {
                    created_by: text,
                    empty_layer: true,
                });
            }

            Instruction::Expose { port } => {
                tracing::warn!(port = %port, "EXPOSE is not recorded in built images");
            }
        }
    }

    let output_dir = build_dir.path().join("output");
    let (digest, layer_count) = assemble_image(&reference, &state, &base, &output_dir)?;

    let stored = store.put(&reference, &digest, &output_dir).await?;

    if !config.quiet {
        println!(
            "Successfully built {} ({} layers, {}, {} cached)",
            reference,
            layer_count,
            format_size(stored.size_bytes),
            state.cached_steps
        );
    }

    tracing::info!(
        reference = %reference,
        digest = %digest,
        layers = layer_count,
        cached_steps = state.cached_steps,
        "Build complete"
    );

    Ok(BuildResult {
        reference,
        digest,
        size: stored.size_bytes,
        layer_count,
        cached_steps: state.cached_steps,
    })
}

/// Check every build input before any step runs.
///
/// A missing source or an unparsable manifest fails here, so the install
/// step is never attempted.
fn preflight(config: &BuildConfig) -> Result<()> {
    let context = &config.context_dir;
    if !context.is_dir() {
        return Err(RelayError::BuildError(format!(
            "Build context not found: {}",
            context.display()
        )));
    }

    let recipe = &config.recipe;
    let manifest_path = context.join(&recipe.manifest);
    let manifest = DependencyManifest::from_file(&manifest_path)?;
    for requirement in manifest.unpinned() {
        tracing::warn!(
            requirement = %requirement,
            "Dependency is not pinned to an exact version; builds may not be reproducible"
        );
    }

    for source in &recipe.sources {
        if !context.join(source).exists() {
            return Err(RelayError::BuildError(format!(
                "Entry point file not found: {} (in context {})",
                source,
                context.display()
            )));
        }
    }

    Ok(())
}

/// Use the base runtime from the local store when it is there.
///
/// Its layers are extracted into the staging rootfs and carried into the
/// image; its environment and working directory are inherited. A base that
/// is not in the store is recorded by reference only and the build runs
/// on an empty rootfs.
async fn resolve_base(recipe: &BuildRecipe, store: &ImageStore, rootfs_dir: &Path) -> Result<BaseImage> {
    let base_ref = recipe.base_reference()?;

    let stored = match store.get(base_ref.as_str()).await {
        Some(image) => Some(image),
        None => store.get(&base_ref.full_reference()).await,
    };

    let Some(stored) = stored else {
        tracing::warn!(
            base = %base_ref,
            "Base image not in the local store; building on an empty rootfs"
        );
        return Ok(BaseImage {
            layers: Vec::new(),
            env: EnvSet::new(),
            workdir: "/".to_string(),
            identity: format!("base:{}", base_ref.full_reference()),
        });
    };

    let image = OciImage::from_path(&stored.path)?;
    let mut layers = Vec::new();
    for path in image.layer_paths() {
        let path = path.clone();
        let rootfs = rootfs_dir.to_path_buf();
        let layer = blocking(move || {
            extract_layer(&path, &rootfs)?;
            LayerInfo::from_file(&path)
        })
        .await?;
        layers.push(layer);
    }

    tracing::debug!(base = %base_ref, digest = %stored.digest, layers = layers.len(), "Resolved base image");

    Ok(BaseImage {
        layers,
        env: image.config().env.clone(),
        workdir: image.config().workdir().to_string(),
        identity: format!("base:{}", stored.digest),
    })
}

/// Execute a RUN step and capture its filesystem changes as a layer.
async fn run_step(
    command: &str,
    state: &BuildState,
    rootfs_dir: &Path,
    layers_dir: &Path,
    step: usize,
    runner: &dyn StepRunner,
    quiet: bool,
) -> Result<LayerInfo> {
    let before = {
        let rootfs = rootfs_dir.to_path_buf();
        blocking(move || DirSnapshot::capture(&rootfs)).await?
    };

    let ctx = StepContext {
        rootfs: rootfs_dir.to_path_buf(),
        workdir: state.workdir.clone(),
        env: state.env.clone(),
    };
    let output = runner.run(command, &ctx).await?;
    if !quiet && !output.stdout.is_empty() {
        print!("{}", output.stdout);
    }

    let rootfs = rootfs_dir.to_path_buf();
    let output_path = layers_dir.join(format!("layer_{}.tar.gz", step));
    blocking(move || {
        let after = DirSnapshot::capture(&rootfs)?;
        let changed = before.diff(&after);
        create_layer(&rootfs, &changed, &output_path)
    })
    .await
}

fn lookup(cache: Option<&BuildCache>, key: &str, no_cache: bool) -> Result<Option<LayerInfo>> {
    match cache {
        Some(cache) if !no_cache => {
            let hit = cache.get(key)?;
            if hit.is_some() {
                tracing::debug!(key = %key, "Build cache hit");
            }
            Ok(hit)
        }
        _ => Ok(None),
    }
}

fn store_in_cache(
    cache: Option<&BuildCache>,
    key: &str,
    layer: LayerInfo,
    created_by: &str,
) -> Result<LayerInfo> {
    match cache {
        Some(cache) => cache.put(key, &layer, created_by),
        None => Ok(layer),
    }
}

async fn apply_layer(layer: &LayerInfo, rootfs_dir: &Path) -> Result<()> {
    let path = layer.path.clone();
    let rootfs = rootfs_dir.to_path_buf();
    blocking(move || extract_layer(&path, &rootfs)).await
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RelayError::BuildError(format!("Build task failed: {}", e)))?
}

/// Write the OCI image layout into `output_dir`.
///
/// Returns the manifest digest and the total layer count. The config
/// carries no timestamps, so unchanged inputs give an unchanged digest.
fn assemble_image(
    reference: &str,
    state: &BuildState,
    base: &BaseImage,
    output_dir: &Path,
) -> Result<(String, usize)> {
    let blobs_dir = output_dir.join("blobs").join("sha256");
    std::fs::create_dir_all(&blobs_dir)
        .map_err(|e| RelayError::BuildError(format!("Failed to create output blobs dir: {}", e)))?;

    let mut layer_descriptors = Vec::new();
    let mut diff_ids = Vec::new();

    for layer in base.layers.iter().chain(state.layers.iter()) {
        let blob_path = blobs_dir.join(&layer.digest);
        if !blob_path.exists() {
            std::fs::copy(&layer.path, &blob_path).map_err(|e| {
                RelayError::BuildError(format!("Failed to copy layer {}: {}", layer.digest, e))
            })?;
        }
        layer_descriptors.push(serde_json::json!({
            "mediaType": LAYER_MEDIA_TYPE,
            "digest": layer.prefixed_digest(),
            "size": layer.size
        }));
        diff_ids.push(format!("sha256:{}", layer.diff_id));
    }

    let mut run_config = serde_json::Map::new();
    if !state.env.is_empty() {
        run_config.insert("Env".to_string(), serde_json::json!(state.env.to_env_list()));
    }
    if !state.entrypoint.is_empty() {
        run_config.insert("Entrypoint".to_string(), serde_json::json!(state.entrypoint));
    }
    if !state.cmd.is_empty() {
        run_config.insert("Cmd".to_string(), serde_json::json!(state.cmd));
    }
    run_config.insert("WorkingDir".to_string(), serde_json::json!(state.workdir));
    if !state.labels.is_empty() {
        run_config.insert("Labels".to_string(), serde_json::json!(state.labels));
    }

    let history: Vec<serde_json::Value> = state
        .history
        .iter()
        .map(|h| {
            let mut entry = serde_json::json!({ "created_by": h.created_by });
            if h.empty_layer {
                entry["empty_layer"] = serde_json::json!(true);
            }
            entry
        })
        .collect();

    let config_obj = serde_json::json!({
        "architecture": oci_arch(),
        "os": "linux",
        "config": run_config,
        "rootfs": {
            "type": "layers",
            "diff_ids": diff_ids
        },
        "history": history
    });

    let config_bytes = serde_json::to_vec_pretty(&config_obj)?;
    let config_digest = sha256_bytes(&config_bytes);
    std::fs::write(blobs_dir.join(&config_digest), &config_bytes)
        .map_err(|e| RelayError::BuildError(format!("Failed to write config blob: {}", e)))?;

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MANIFEST_MEDIA_TYPE,
        "config": {
            "mediaType": CONFIG_MEDIA_TYPE,
            "digest": format!("sha256:{}", config_digest),
            "size": config_bytes.len()
        },
        "layers": layer_descriptors
    });
    let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
    let manifest_digest = sha256_bytes(&manifest_bytes);
    std::fs::write(blobs_dir.join(&manifest_digest), &manifest_bytes)
        .map_err(|e| RelayError::BuildError(format!("Failed to write manifest blob: {}", e)))?;

    let index = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": INDEX_MEDIA_TYPE,
        "manifests": [{
            "mediaType": MANIFEST_MEDIA_TYPE,
            "digest": format!("sha256:{}", manifest_digest),
            "size": manifest_bytes.len(),
            "annotations": {
                "org.opencontainers.image.ref.name": reference
            }
        }]
    });
    std::fs::write(output_dir.join("index.json"), serde_json::to_string_pretty(&index)?)
        .map_err(|e| RelayError::BuildError(format!("Failed to write index.json: {}", e)))?;

    std::fs::write(output_dir.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#)
        .map_err(|e| RelayError::BuildError(format!("Failed to write oci-layout: {}", e)))?;

    Ok((
        format!("sha256:{}", manifest_digest),
        base.layers.len() + state.layers.len(),
    ))
}

fn oci_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Format a byte size as a human-readable string.
pub(crate) fn format_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 * 1024 {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    } else if bytes >= 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::runner::StepOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records commands and writes a marker file instead of running them.
    #[derive(Default)]
    struct RecordingRunner {
        commands: Mutex<Vec<String>>,
        envs: Mutex<Vec<EnvSet>>,
    }

    #[async_trait]
    impl StepRunner for RecordingRunner {
        async fn run(&self, command: &str, ctx: &StepContext) -> Result<StepOutput> {
            self.commands.lock().unwrap().push(command.to_string());
            self.envs.lock().unwrap().push(ctx.env.clone());
            let dir = ctx.rootfs.join("site-packages");
            std::fs::create_dir_all(&dir)?;
            std::fs::write(dir.join("installed"), command)?;
            Ok(StepOutput::default())
        }
    }

    fn context() -> TempDir {
        let ctx = TempDir::new().unwrap();
        std::fs::write(ctx.path().join("requirements.txt"), "flask==3.0.0\n").unwrap();
        std::fs::write(ctx.path().join("main.py"), "print('hi')\n").unwrap();
        ctx
    }

    fn config(ctx: &Path, cache: Option<PathBuf>) -> BuildConfig {
        let mut config = BuildConfig::new(ctx, BuildRecipe::default_python());
        config.tag = Some("relay:test".to_string());
        config.cache_dir = cache;
        config
    }

    #[tokio::test]
    async fn test_build_stores_image_with_contract_config() {
        let ctx = context();
        let home = TempDir::new().unwrap();
        let store = Arc::new(ImageStore::new(&home.path().join("images"), u64::MAX).unwrap());
        let runner = RecordingRunner::default();

        let result = build(config(ctx.path(), None), store.clone(), &runner).await.unwrap();
        assert_eq!(result.reference, "relay:test");
        assert!(result.digest.starts_with("sha256:"));
        assert_eq!(result.layer_count, 3);
        assert_eq!(result.cached_steps, 0);

        let stored = store.get("relay:test").await.unwrap();
        let image = OciImage::from_path(&stored.path).unwrap();
        let cfg = image.config();
        assert_eq!(cfg.env.get("PORT"), Some("8080"));
        assert_eq!(cfg.command(), vec!["python".to_string(), "main.py".to_string()]);
        assert_eq!(cfg.workdir(), "/app");
        assert_eq!(image.layer_paths().len(), 3);

        assert_eq!(
            *runner.commands.lock().unwrap(),
            vec!["pip install --no-cache-dir -r requirements.txt".to_string()]
        );
    }

    #[tokio::test]
    async fn test_build_layers_contain_sources() {
        let ctx = context();
        let home = TempDir::new().unwrap();
        let store = Arc::new(ImageStore::new(home.path(), u64::MAX).unwrap());
        build(config(ctx.path(), None), store.clone(), &RecordingRunner::default())
            .await
            .unwrap();

        let stored = store.get("relay:test").await.unwrap();
        let image = OciImage::from_path(&stored.path).unwrap();
        let rootfs = TempDir::new().unwrap();
        for layer in image.layer_paths() {
            extract_layer(layer, rootfs.path()).unwrap();
        }
        assert!(rootfs.path().join("app/requirements.txt").is_file());
        assert_eq!(
            std::fs::read_to_string(rootfs.path().join("app/main.py")).unwrap(),
            "print('hi')\n"
        );
    }

    #[tokio::test]
    async fn test_preflight_missing_manifest() {
        let ctx = TempDir::new().unwrap();
        std::fs::write(ctx.path().join("main.py"), "").unwrap();
        let home = TempDir::new().unwrap();
        let store = Arc::new(ImageStore::new(home.path(), u64::MAX).unwrap());
        let runner = RecordingRunner::default();

        assert!(build(config(ctx.path(), None), store.clone(), &runner).await.is_err());
        assert!(runner.commands.lock().unwrap().is_empty());
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_preflight_invalid_manifest() {
        let ctx = context();
        std::fs::write(ctx.path().join("requirements.txt"), "flask==\n").unwrap();
        let home = TempDir::new().unwrap();
        let store = Arc::new(ImageStore::new(home.path(), u64::MAX).unwrap());
        let runner = RecordingRunner::default();

        let err = build(config(ctx.path(), None), store, &runner).await.unwrap_err();
        assert!(matches!(err, RelayError::ManifestError { line: 1, .. }));
        assert!(runner.commands.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_cache_skips_lookups() {
        let ctx = context();
        let home = TempDir::new().unwrap();
        let cache_dir = home.path().join("cache");
        let store = Arc::new(ImageStore::new(&home.path().join("images"), u64::MAX).unwrap());
        let runner = RecordingRunner::default();

        build(config(ctx.path(), Some(cache_dir.clone())), store.clone(), &runner)
            .await
            .unwrap();
        let mut cfg = config(ctx.path(), Some(cache_dir.clone()));
        cfg.no_cache = true;
        let result = build(cfg, store.clone(), &runner).await.unwrap();

        assert_eq!(result.cached_steps, 0);
        assert_eq!(runner.commands.lock().unwrap().len(), 2);

        let result = build(config(ctx.path(), Some(cache_dir)), store, &runner).await.unwrap();
        assert_eq!(result.cached_steps, 3);
        assert_eq!(runner.commands.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_base_from_store_is_inherited() {
        let ctx = context();
        let home = TempDir::new().unwrap();
        let store = Arc::new(ImageStore::new(home.path(), u64::MAX).unwrap());

        // A "base" image: any built image stored under the base reference
        let base_ctx = context();
        let mut base_cfg = config(base_ctx.path(), None);
        base_cfg.tag = Some("python:3.11-slim".to_string());
        base_cfg.recipe.env.set("PYTHONUNBUFFERED", "1");
        build(base_cfg, store.clone(), &RecordingRunner::default()).await.unwrap();

        let result = build(config(ctx.path(), None), store.clone(), &RecordingRunner::default())
            .await
            .unwrap();
        assert_eq!(result.layer_count, 6);

        let stored = store.get("relay:test").await.unwrap();
        let image = OciImage::from_path(&stored.path).unwrap();
        assert_eq!(image.config().env.get("PYTHONUNBUFFERED"), Some("1"));
        assert_eq!(image.config().env.get("PORT"), Some("8080"));
    }

    #[tokio::test]
    async fn test_build_env_reaches_install_and_references_resolve() {
        let ctx = context();
        let home = TempDir::new().unwrap();
        let store = Arc::new(ImageStore::new(home.path(), u64::MAX).unwrap());

        let base_ctx = context();
        let mut base_cfg = config(base_ctx.path(), None);
        base_cfg.tag = Some("python:3.11-slim".to_string());
        base_cfg.recipe.env.set("PATH", "/usr/local/bin");
        build(base_cfg, store.clone(), &RecordingRunner::default()).await.unwrap();

        let mut cfg = config(ctx.path(), None);
        cfg.recipe
            .build_env
            .set("PIP_INDEX_URL", "https://pypi.internal/simple");
        cfg.recipe.env.set("PATH", "/opt/venv/bin:$PATH");
        cfg.recipe.env.set("EMPTY", "${NOT_SET}");
        let runner = RecordingRunner::default();
        build(cfg, store.clone(), &runner).await.unwrap();

        let envs = runner.envs.lock().unwrap();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].get("PIP_INDEX_URL"), Some("https://pypi.internal/simple"));

        let stored = store.get("relay:test").await.unwrap();
        let image = OciImage::from_path(&stored.path).unwrap();
        let env = &image.config().env;
        assert_eq!(env.get("PATH"), Some("/opt/venv/bin:/usr/local/bin"));
        assert_eq!(env.get("EMPTY"), Some(""));
        assert_eq!(env.get("PIP_INDEX_URL"), Some("https://pypi.internal/simple"));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(500), "500 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(1_500_000), "1.4 MB");
        assert_eq!(format_size(1_500_000_000), "1.4 GB");
    }

    #[test]
    fn test_oci_arch() {
        assert!(!oci_arch().is_empty());
    }
}
