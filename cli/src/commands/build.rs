//! `relaybox build` command - build an image from a build context.
//!
//! The recipe comes from `-f <file>` when given, else `relaybox.yaml`,
//! else `Dockerfile`, else the canonical Python recipe.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use relaybox_runtime::{build, BuildConfig, BuildRecipe, ImageStore, ShellRunner};

use super::init::RECIPE_FILE;
use crate::output;

#[derive(Args)]
pub struct BuildArgs {
    /// Build context directory (contains the manifest and sources)
    #[arg(default_value = ".")]
    pub path: String,

    /// Name and optionally tag for the image (e.g., "relay:1.0")
    #[arg(short = 't', long = "tag")]
    pub tag: Option<String>,

    /// Recipe file: a Dockerfile, or YAML when it ends in .yaml/.yml
    #[arg(short = 'f', long = "file")]
    pub file: Option<String>,

    /// Do not reuse cached layers (new layers are still cached)
    #[arg(long)]
    pub no_cache: bool,

    /// Suppress build output and print only the image digest
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: BuildArgs) -> Result<(), Box<dyn std::error::Error>> {
    let context_dir = PathBuf::from(&args.path)
        .canonicalize()
        .map_err(|e| format!("Invalid build context path '{}': {}", args.path, e))?;

    if !context_dir.is_dir() {
        return Err(format!(
            "Build context '{}' is not a directory",
            context_dir.display()
        )
        .into());
    }

    let recipe = load_recipe(&context_dir, args.file.as_deref())?;

    let store_config = super::store_config();
    let store = Arc::new(super::open_image_store()?);

    let mut config = BuildConfig::new(&context_dir, recipe);
    config.tag = args.tag.clone();
    config.cache_dir = Some(store_config.cache_dir());
    config.no_cache = args.no_cache;
    config.quiet = args.quiet;

    let result = build(config, store.clone(), &ShellRunner::new()).await?;
    let evicted = evict_over_limit(&store).await?;

    if args.quiet {
        println!("{}", result.digest);
    } else {
        println!(
            "Successfully built {} ({}, {} layers, {} cached steps)",
            result.reference,
            output::format_bytes(result.size),
            result.layer_count,
            result.cached_steps
        );
        println!("{}", result.digest);
    }
    if !args.quiet && !evicted.is_empty() {
        println!(
            "Evicted {} image(s) to stay within the store limit: {}",
            evicted.len(),
            evicted.join(", ")
        );
    }
    if evicted.contains(&result.reference) {
        tracing::warn!(
            reference = %result.reference,
            "The new image alone exceeds the store limit and was evicted"
        );
    }

    Ok(())
}

/// Drop least-recently-used images until the store fits its size limit.
async fn evict_over_limit(store: &ImageStore) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let evicted = store.evict().await?;
    if !evicted.is_empty() {
        tracing::info!(
            count = evicted.len(),
            total_bytes = store.total_size().await,
            "Evicted images over the store limit"
        );
    }
    Ok(evicted)
}

/// Pick and load the recipe for a context.
fn load_recipe(
    context_dir: &Path,
    file: Option<&str>,
) -> Result<BuildRecipe, Box<dyn std::error::Error>> {
    let path = match file {
        Some(f) => {
            let p = PathBuf::from(f);
            let p = if p.is_absolute() { p } else { context_dir.join(p) };
            if !p.is_file() {
                return Err(format!("Recipe file not found at {}", p.display()).into());
            }
            p
        }
        None => {
            let yaml = context_dir.join(RECIPE_FILE);
            let dockerfile = context_dir.join("Dockerfile");
            if yaml.is_file() {
                yaml
            } else if dockerfile.is_file() {
                dockerfile
            } else {
                tracing::info!("No recipe file in context, using the default Python recipe");
                return Ok(BuildRecipe::default_python());
            }
        }
    };

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let recipe = if is_yaml {
        BuildRecipe::from_yaml_file(&path)?
    } else {
        BuildRecipe::from_dockerfile_path(&path)?
    };
    tracing::debug!(path = %path.display(), base = %recipe.base, "Loaded recipe");
    Ok(recipe)
}
