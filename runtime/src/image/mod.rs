//! Image building.
//!
//! Turns a pinned base runtime, a dependency manifest and entry-point
//! source files into an OCI image in the local store.
//!
//! ## Build flow
//!
//! ```text
//! BuildRecipe ──→ Dockerfile ──→ engine::build ──→ ImageStore
//!                                   │
//!                     BuildCache ←──┤ (per-step layers)
//!                     StepRunner ←──┘ (RUN steps)
//! ```

pub mod cache;
pub mod config;
pub mod dockerfile;
pub mod engine;
pub mod env;
pub mod layer;
pub mod manifest;
pub mod recipe;
pub mod reference;
pub mod runner;
pub mod store;

pub use cache::{cache_key, BuildCache, CacheMeta};
pub use config::{ImageConfig, OciImage};
pub use dockerfile::{Dockerfile, Instruction};
pub use engine::{build, BuildConfig, BuildResult};
pub use env::EnvSet;
pub use layer::LayerInfo;
pub use manifest::{DependencyManifest, ManifestEntry, Requirement, VersionSpec};
pub use recipe::BuildRecipe;
pub use reference::ImageReference;
pub use runner::{ShellRunner, StepContext, StepOutput, StepRunner, DEFAULT_PATH};
pub use store::{ImageStore, StoredImage};
