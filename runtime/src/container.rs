//! Container launcher.
//!
//! A container is an ephemeral process started from a stored image:
//! create (extract layers into a scratch rootfs, resolve the environment)
//! → run the entry command → terminate. The scratch rootfs is removed
//! when the `Container` is dropped.

use std::path::{Path, PathBuf};

use relaybox_core::error::{RelayError, Result};

use crate::image::config::OciImage;
use crate::image::env::EnvSet;
use crate::image::layer::{extract_layer, sha256_bytes};
use crate::image::runner::{can_chroot, exit_code, host_workdir, DEFAULT_PATH};
use crate::image::store::StoredImage;
use crate::image::ImageConfig;

/// Launch-time options.
#[derive(Debug, Clone, Default)]
pub struct ContainerOptions {
    /// Environment overrides; each one replaces the image default
    pub env: EnvSet,
    /// Replace the image command (Entrypoint + Cmd)
    pub command: Option<Vec<String>>,
    /// Parent directory for the scratch rootfs (system temp dir if unset)
    pub scratch_dir: Option<PathBuf>,
}

/// How the entry process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code; signals are reported as 128 + signo
    pub code: i32,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "exit status {}", self.code)
    }
}

/// A created container.
pub struct Container {
    id: String,
    reference: String,
    config: ImageConfig,
    env: EnvSet,
    command: Vec<String>,
    rootfs: tempfile::TempDir,
}

impl Container {
    /// Instantiate `image`: extract its layers and resolve the environment.
    pub async fn create(image: &StoredImage, options: ContainerOptions) -> Result<Self> {
        options
            .env
            .validate()
            .map_err(|e| RelayError::ContainerError(e.to_string()))?;

        let oci = OciImage::from_path(&image.path)?;
        let config = oci.config().clone();

        let command = options.command.clone().unwrap_or_else(|| config.command());
        if command.is_empty() {
            return Err(RelayError::ContainerError(format!(
                "Image {} declares no command",
                image.reference
            )));
        }

        let rootfs = match &options.scratch_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                tempfile::Builder::new().prefix("relaybox-ctr-").tempdir_in(dir)
            }
            None => tempfile::Builder::new().prefix("relaybox-ctr-").tempdir(),
        }
        .map_err(|e| RelayError::ContainerError(format!("Failed to create container rootfs: {}", e)))?;

        let layers = oci.layer_paths().to_vec();
        let target = rootfs.path().to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            for layer in &layers {
                extract_layer(layer, &target)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| RelayError::ContainerError(format!("Layer extraction failed: {}", e)))??;

        let env = config.env.overlay(&options.env);
        let id = container_id(&image.digest);

        tracing::debug!(
            id = %id,
            image = %image.reference,
            rootfs = %rootfs.path().display(),
            "Created container"
        );

        Ok(Self {
            id,
            reference: image.reference.clone(),
            config,
            env,
            command,
            rootfs,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Resolved environment: image defaults overlaid by overrides.
    pub fn env(&self) -> &EnvSet {
        &self.env
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn rootfs(&self) -> &Path {
        self.rootfs.path()
    }

    /// Host directory backing the image working directory.
    pub fn workdir(&self) -> PathBuf {
        host_workdir(self.rootfs.path(), self.config.workdir())
    }

    /// Run the entry command to completion and report its exit status.
    ///
    /// No restart and no supervision: the exit code is the result.
    pub async fn run(&self) -> Result<ExitStatus> {
        let workdir = self.workdir();
        std::fs::create_dir_all(&workdir)?;

        let mut cmd = if can_chroot(self.rootfs.path()) {
            let mut cmd = tokio::process::Command::new("chroot");
            cmd.arg(self.rootfs.path())
                .arg("/bin/sh")
                .arg("-c")
                .arg(r#"cd "$0" && exec "$@""#)
                .arg(self.config.workdir())
                .args(&self.command)
                .current_dir("/");
            cmd
        } else {
            let mut cmd = tokio::process::Command::new(&self.command[0]);
            cmd.args(&self.command[1..]).current_dir(&workdir);
            cmd
        };

        cmd.env_clear();
        if self.env.get("PATH").is_none() {
            cmd.env("PATH", DEFAULT_PATH);
        }
        for (key, value) in self.env.iter() {
            cmd.env(key, value);
        }
        cmd.kill_on_drop(true);

        tracing::info!(
            id = %self.id,
            image = %self.reference,
            command = ?self.command,
            "Starting container"
        );

        let status = cmd.status().await.map_err(|e| {
            RelayError::ContainerError(format!("Failed to start {:?}: {}", self.command, e))
        })?;

        let status = ExitStatus {
            code: exit_code(&status),
        };
        tracing::info!(id = %self.id, code = status.code, "Container exited");
        Ok(status)
    }
}

fn container_id(digest: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let seed = format!("{}:{}:{}", digest, std::process::id(), nanos);
    sha256_bytes(seed.as_bytes())[..12].to_string()
}
