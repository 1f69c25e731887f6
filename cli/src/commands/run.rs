//! `relaybox run` command - start a container and wait for it to exit.
//!
//! The container's exit code becomes the exit code of `relaybox`.

use clap::Args;
use relaybox_runtime::{Container, ContainerOptions, EnvSet};

#[derive(Args)]
pub struct RunArgs {
    /// Image reference or digest prefix
    pub image: String,

    /// Set environment variables (KEY=VALUE), can be repeated
    #[arg(short = 'e', long = "env")]
    pub env: Vec<String>,

    /// Command to run instead of the image command
    #[arg(last = true)]
    pub command: Vec<String>,
}

pub async fn execute(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let env = parse_env(&args.env)?;

    let store_config = super::store_config();
    let store = super::open_image_store()?;
    let image = store
        .resolve(&args.image)
        .await
        .ok_or_else(|| format!("Image not found: {}", args.image))?;

    let options = ContainerOptions {
        env,
        command: (!args.command.is_empty()).then(|| args.command.clone()),
        scratch_dir: Some(store_config.containers_dir()),
    };

    let container = Container::create(&image, options).await?;
    let status = container.run().await?;
    // Remove the scratch rootfs before exiting
    drop(container);

    if !status.success() {
        std::process::exit(status.code);
    }
    Ok(())
}

fn parse_env(pairs: &[String]) -> Result<EnvSet, String> {
    let mut env = EnvSet::new();
    for pair in pairs {
        let (key, value) = super::parse_key_value(pair)?;
        env.set(key, value);
    }
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_last_wins() {
        let env = parse_env(&["PORT=3000".to_string(), "PORT=4000".to_string()]).unwrap();
        assert_eq!(env.get("PORT"), Some("4000"));
        assert_eq!(env.len(), 1);
    }

    #[test]
    fn test_parse_env_invalid() {
        assert!(parse_env(&["PORT".to_string()]).is_err());
    }
}
