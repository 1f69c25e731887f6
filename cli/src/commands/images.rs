//! `relaybox images` command.

use clap::Args;
use relaybox_runtime::{ImageReference, StoredImage};

use crate::output;

const HEADERS: [&str; 5] = ["REPOSITORY", "TAG", "DIGEST", "SIZE", "BUILT"];

#[derive(Args)]
pub struct ImagesArgs {
    /// Only show image references (one per line)
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: ImagesArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_image_store()?;
    let images = store.list().await;

    if args.quiet {
        for image in &images {
            println!("{}", image.reference);
        }
        return Ok(());
    }

    let mut table = output::new_table(&HEADERS);
    for image in &images {
        table.add_row(row(image));
    }
    println!("{table}");
    Ok(())
}

fn row(image: &StoredImage) -> [String; 5] {
    let (repository, tag) = match ImageReference::parse(&image.reference) {
        Ok(r) => {
            // Local images parse as docker.io/library/<name>; show them bare
            let repository = if r.registry == "docker.io" {
                r.repository
                    .strip_prefix("library/")
                    .unwrap_or(&r.repository)
                    .to_string()
            } else {
                format!("{}/{}", r.registry, r.repository)
            };
            (repository, r.tag.unwrap_or_else(|| "<none>".to_string()))
        }
        Err(_) => (image.reference.clone(), "<none>".to_string()),
    };

    [
        repository,
        tag,
        output::short_digest(&image.digest),
        output::format_bytes(image.size_bytes),
        output::format_ago(&image.built_at),
    ]
}
