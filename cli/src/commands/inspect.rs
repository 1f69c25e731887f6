//! `relaybox inspect` command - display image metadata as JSON.

use clap::Args;
use relaybox_runtime::OciImage;

#[derive(Args)]
pub struct InspectArgs {
    /// Image reference or digest prefix
    pub image: String,
}

pub async fn execute(args: InspectArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_image_store()?;

    let stored = store
        .resolve(&args.image)
        .await
        .ok_or_else(|| format!("Image not found: {}", args.image))?;

    let oci = OciImage::from_path(&stored.path)?;
    let config = oci.config();

    let env: serde_json::Map<String, serde_json::Value> = config
        .env
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
        .collect();

    let output = serde_json::json!({
        "Reference": stored.reference,
        "Digest": stored.digest,
        "ManifestDigest": oci.manifest_digest(),
        "Size": stored.size_bytes,
        "BuiltAt": stored.built_at.to_rfc3339(),
        "LastUsed": stored.last_used.to_rfc3339(),
        "Config": {
            "Entrypoint": config.entrypoint,
            "Cmd": config.cmd,
            "Env": env,
            "WorkingDir": config.workdir(),
            "Labels": config.labels,
        },
        "Layers": oci.diff_ids(),
    });

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
