//! relaybox core - shared types used across the relaybox workspace.
//!
//! Error handling, configuration and logging setup live here so the
//! image builder, the container launcher and the relay agree on them.

pub mod config;
pub mod error;
pub mod log;

// Re-export commonly used types
pub use config::{ProxyConfig, StoreConfig};
pub use error::{RelayError, Result};
pub use log::{init_tracing, LogFormat};

/// relaybox version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
