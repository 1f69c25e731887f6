//! `relaybox init` command - scaffold a build context.
//!
//! Writes the canonical recipe twice (as `Dockerfile` and as
//! `relaybox.yaml`) next to a starter manifest and entry point.

use std::path::{Path, PathBuf};

use clap::Args;
use relaybox_runtime::image::recipe::{DEFAULT_ENTRYPOINT_FILE, DEFAULT_MANIFEST};
use relaybox_runtime::BuildRecipe;

/// Recipe file picked up by `relaybox build`.
pub(crate) const RECIPE_FILE: &str = "relaybox.yaml";

const MANIFEST_TEMPLATE: &str = "\
# One dependency per line, pinned to an exact version (name==version).
";

const ENTRYPOINT_TEMPLATE: &str = r#"import os
from http.server import BaseHTTPRequestHandler, HTTPServer


class Handler(BaseHTTPRequestHandler):
    def do_GET(self):
        self.send_response(200)
        self.send_header("Content-Type", "text/plain")
        self.end_headers()
        self.wfile.write(b"ok\n")


if __name__ == "__main__":
    port = int(os.environ.get("PORT", "8080"))
    HTTPServer(("0.0.0.0", port), Handler).serve_forever()
"#;

#[derive(Args)]
pub struct InitArgs {
    /// Directory to scaffold
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Overwrite existing files
    #[arg(short, long)]
    pub force: bool,
}

pub async fn execute(args: InitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let written = scaffold(&args.path, args.force)?;
    for name in &written {
        println!("Created {}", args.path.join(name).display());
    }
    Ok(())
}

/// Write the scaffold files and return their names.
///
/// Fails without writing anything when a file exists and `force` is unset.
fn scaffold(dir: &Path, force: bool) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let recipe = BuildRecipe::default_python();
    let files = [
        ("Dockerfile", recipe.to_dockerfile().render()),
        (DEFAULT_MANIFEST, MANIFEST_TEMPLATE.to_string()),
        (DEFAULT_ENTRYPOINT_FILE, ENTRYPOINT_TEMPLATE.to_string()),
        (RECIPE_FILE, recipe.to_yaml()?),
    ];

    if !force {
        let existing: Vec<&str> = files
            .iter()
            .map(|(name, _)| *name)
            .filter(|name| dir.join(name).exists())
            .collect();
        if !existing.is_empty() {
            return Err(format!(
                "Refusing to overwrite {} in {} (use --force)",
                existing.join(", "),
                dir.display()
            )
            .into());
        }
    }

    std::fs::create_dir_all(dir)?;
    let mut written = Vec::with_capacity(files.len());
    for (name, content) in files {
        std::fs::write(dir.join(name), content)?;
        written.push(name.to_string());
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scaffold_writes_loadable_recipes() {
        let tmp = TempDir::new().unwrap();
        let written = scaffold(tmp.path(), false).unwrap();
        assert_eq!(written.len(), 4);

        let from_yaml = BuildRecipe::from_yaml_file(&tmp.path().join(RECIPE_FILE)).unwrap();
        let from_dockerfile =
            BuildRecipe::from_dockerfile_path(&tmp.path().join("Dockerfile")).unwrap();
        assert_eq!(from_yaml.base, from_dockerfile.base);
        assert_eq!(from_yaml.command, from_dockerfile.command);
        assert_eq!(from_yaml.env.get("PORT"), Some("8080"));

        let manifest = relaybox_runtime::DependencyManifest::from_file(
            &tmp.path().join(DEFAULT_MANIFEST),
        )
        .unwrap();
        assert!(manifest.is_empty());
        assert!(tmp.path().join(DEFAULT_ENTRYPOINT_FILE).is_file());
    }

    #[test]
    fn test_scaffold_refuses_overwrite() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("main.py"), "print('mine')\n").unwrap();

        let err = scaffold(tmp.path(), false).unwrap_err();
        assert!(err.to_string().contains("main.py"));
        // Nothing else was written
        assert!(!tmp.path().join("Dockerfile").exists());
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("main.py")).unwrap(),
            "print('mine')\n"
        );

        scaffold(tmp.path(), true).unwrap();
        assert!(tmp.path().join("Dockerfile").exists());
    }
}
