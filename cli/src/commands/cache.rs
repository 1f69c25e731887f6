//! `relaybox cache` command - manage the build layer cache.

use clap::{Args, Subcommand};
use relaybox_core::StoreConfig;
use relaybox_runtime::BuildCache;

use crate::output;

#[derive(Args)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Subcommand)]
pub enum CacheCommand {
    /// Evict least recently used layers until the cache fits its limit
    Prune(PruneArgs),
}

#[derive(Args)]
pub struct PruneArgs {
    /// Size limit (e.g., "500m", "2g"); defaults to the configured limit
    #[arg(long, value_parser = output::parse_size_bytes)]
    pub max_size: Option<u64>,

    /// Remove every cached layer
    #[arg(short, long, conflicts_with = "max_size")]
    pub all: bool,
}

pub async fn execute(args: CacheArgs) -> Result<(), Box<dyn std::error::Error>> {
    match args.command {
        CacheCommand::Prune(args) => {
            let (removed, freed) = prune(&super::store_config(), &args)?;
            println!(
                "Removed {} cache entries, freed {}",
                removed,
                output::format_bytes(freed)
            );
            Ok(())
        }
    }
}

/// Returns the number of evicted entries and the bytes freed.
fn prune(
    store_config: &StoreConfig,
    args: &PruneArgs,
) -> Result<(usize, u64), Box<dyn std::error::Error>> {
    let cache = BuildCache::new(&store_config.cache_dir())?;

    let before = cache.total_size()?;
    let removed = if args.all {
        // Size-based pruning keeps zero-byte layers; drop them too
        let entries = cache.list_entries()?;
        for entry in &entries {
            cache.invalidate(&entry.key)?;
        }
        entries.len()
    } else {
        cache.prune(args.max_size.unwrap_or(store_config.max_cache_bytes))?
    };
    let after = cache.total_size()?;

    Ok((removed, before.saturating_sub(after)))
}
