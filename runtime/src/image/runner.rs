//! Build step execution.
//!
//! The engine hands every RUN step to a [`StepRunner`]. [`ShellRunner`]
//! executes it with `/bin/sh -c`, inside the staging rootfs via `chroot`
//! when the rootfs carries its own shell and we are root, and on the host
//! with the staging workdir as current directory otherwise.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use relaybox_core::error::{RelayError, Result};

use super::env::EnvSet;

/// PATH given to build steps and containers.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Where and how a step runs.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Staging root filesystem
    pub rootfs: PathBuf,
    /// Working directory inside the image
    pub workdir: String,
    /// Image environment at this point of the build
    pub env: EnvSet,
}

/// Captured output of a successful step.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Executes RUN steps.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Run `command`. A non-zero exit is `RelayError::StepFailed`.
    async fn run(&self, command: &str, ctx: &StepContext) -> Result<StepOutput>;
}

/// Runs steps through `/bin/sh -c`.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StepRunner for ShellRunner {
    async fn run(&self, command: &str, ctx: &StepContext) -> Result<StepOutput> {
        let mut cmd = if can_chroot(&ctx.rootfs) {
            let mut cmd = tokio::process::Command::new("chroot");
            cmd.arg(&ctx.rootfs)
                .arg("/bin/sh")
                .arg("-c")
                .arg(format!("cd {} && {}", shell_quote(&ctx.workdir), command))
                .current_dir("/");
            cmd
        } else {
            let workdir = host_workdir(&ctx.rootfs, &ctx.workdir);
            std::fs::create_dir_all(&workdir)?;
            let mut cmd = tokio::process::Command::new("/bin/sh");
            cmd.arg("-c").arg(command).current_dir(workdir);
            cmd
        };

        cmd.env_clear();
        cmd.env("PATH", DEFAULT_PATH);
        cmd.env("HOME", "/root");
        for (key, value) in ctx.env.iter() {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null());

        tracing::debug!(command = %command, rootfs = %ctx.rootfs.display(), "Running build step");

        let output = cmd.output().await.map_err(|e| {
            RelayError::BuildError(format!("Failed to execute RUN command: {}", e))
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(RelayError::StepFailed {
                step: format!("RUN {}", command),
                exit_code: exit_code(&output.status),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(StepOutput { stdout, stderr })
    }
}

/// Map a process status to a shell-style exit code (signals → 128 + signo).
pub fn exit_code(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// True when `rootfs` carries a shell and we may enter it with chroot.
pub(crate) fn can_chroot(rootfs: &Path) -> bool {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: geteuid has no preconditions and cannot fail.
        let is_root = unsafe { libc::geteuid() } == 0;
        is_root && rootfs.join("bin/sh").exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = rootfs;
        false
    }
}

/// The host directory backing an image workdir.
pub(crate) fn host_workdir(rootfs: &Path, workdir: &str) -> PathBuf {
    rootfs.join(workdir.trim_start_matches('/'))
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
