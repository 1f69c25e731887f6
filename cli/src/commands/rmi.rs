//! `relaybox rmi` command - remove one or more stored images.

use clap::Args;

#[derive(Args)]
pub struct RmiArgs {
    /// Image references or digest prefixes to remove
    #[arg(required = true)]
    pub images: Vec<String>,

    /// Ignore images that do not exist
    #[arg(short, long)]
    pub force: bool,
}

pub async fn execute(args: RmiArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_image_store()?;

    let mut errors: Vec<String> = Vec::new();
    for reference in &args.images {
        match store.remove(reference).await {
            Ok(image) => println!("Removed: {} ({})", image.reference, image.digest),
            Err(_) if args.force => continue,
            Err(e) => errors.push(format!("{reference}: {e}")),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(format!("Failed to remove image(s):\n{}", errors.join("\n")).into())
    }
}
