//! relaybox runtime - image building and container launching.
//!
//! Turns a pinned base image, a dependency manifest and application
//! sources into a layered OCI image, stores it locally, and starts
//! containers from it with the image environment applied.

#![allow(clippy::result_large_err)]

pub mod container;
pub mod image;

// Re-export common types
pub use container::{Container, ContainerOptions, ExitStatus};
pub use image::{
    build, BuildCache, BuildConfig, BuildRecipe, BuildResult, DependencyManifest, Dockerfile,
    EnvSet, ImageConfig, ImageReference, ImageStore, Instruction, OciImage, Requirement,
    ShellRunner, StepContext, StepOutput, StepRunner, StoredImage,
};

/// relaybox runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Reference used when a build is not given a tag.
pub const DEFAULT_IMAGE_TAG: &str = "relaybox-build:dev";
