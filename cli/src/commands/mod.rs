//! CLI command definitions and dispatch.

mod build;
mod cache;
mod init;
mod inspect;
mod images;
mod rmi;
mod run;
mod serve;

use clap::{Parser, Subcommand};
use relaybox_core::StoreConfig;
use relaybox_runtime::ImageStore;

/// relaybox - build and run reproducible images for the llama.cpp relay.
#[derive(Parser)]
#[command(name = "relaybox", version, about)]
pub struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Scaffold a build context (Dockerfile, manifest, entry point, recipe)
    Init(init::InitArgs),
    /// Build an image from a build context
    Build(build::BuildArgs),
    /// List stored images
    Images(images::ImagesArgs),
    /// Display image metadata as JSON
    Inspect(inspect::InspectArgs),
    /// Remove one or more stored images
    Rmi(rmi::RmiArgs),
    /// Start a container from an image and wait for it to exit
    Run(run::RunArgs),
    /// Run the streaming relay in front of a llama.cpp server
    Serve(serve::ServeArgs),
    /// Manage the build layer cache
    Cache(cache::CacheArgs),
}

/// State layout rooted at `RELAYBOX_HOME` (default `~/.relaybox`).
pub(crate) fn store_config() -> StoreConfig {
    StoreConfig::from_env()
}

/// Open the shared image store.
pub(crate) fn open_image_store() -> Result<ImageStore, Box<dyn std::error::Error>> {
    let config = store_config();
    let store = ImageStore::new(&config.images_dir(), config.max_image_bytes)?;
    Ok(store)
}

/// Split `KEY=VALUE`.
pub(crate) fn parse_key_value(arg: &str) -> Result<(String, String), String> {
    let (key, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("Invalid value (expected KEY=VALUE): {arg}"))?;
    if key.is_empty() {
        return Err(format!("Invalid value (empty key): {arg}"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Init(args) => init::execute(args).await,
        Command::Build(args) => build::execute(args).await,
        Command::Images(args) => images::execute(args).await,
        Command::Inspect(args) => inspect::execute(args).await,
        Command::Rmi(args) => rmi::execute(args).await,
        Command::Run(args) => run::execute(args).await,
        Command::Serve(args) => serve::execute(args).await,
        Command::Cache(args) => cache::execute(args).await,
    }
}
