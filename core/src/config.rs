use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{RelayError, Result};

/// Environment variable carrying the port the contained process binds.
pub const PORT_ENV: &str = "PORT";

/// Default value of `PORT` baked into every image.
pub const DEFAULT_PORT: u16 = 8080;

/// Environment variable naming the upstream llama.cpp server.
pub const UPSTREAM_ENV: &str = "LLAMA_SERVER";

/// Default upstream llama.cpp server.
pub const DEFAULT_UPSTREAM: &str = "http://localhost:9997";

/// Environment variable overriding the relaybox state directory.
pub const HOME_ENV: &str = "RELAYBOX_HOME";

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Interface to bind
    pub host: String,

    /// Port to bind (from `PORT`)
    pub port: u16,

    /// Base URL of the llama.cpp server (from `LLAMA_SERVER`)
    pub upstream: String,

    /// Upstream connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// Whole-request timeout for buffered (non-streaming) requests in seconds
    pub request_timeout_secs: u64,

    /// Largest accepted request body in bytes
    pub max_body_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            upstream: DEFAULT_UPSTREAM.to_string(),
            connect_timeout_secs: 10,
            request_timeout_secs: 300, // 5 minutes
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

impl ProxyConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    ///
    /// Unset or empty variables fall back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(port) = lookup(PORT_ENV).filter(|v| !v.trim().is_empty()) {
            config.port = port.trim().parse().map_err(|_| {
                RelayError::ConfigError(format!(
                    "{} must be a port number between 0 and 65535, got '{}'",
                    PORT_ENV, port
                ))
            })?;
        }

        if let Some(upstream) = lookup(UPSTREAM_ENV).filter(|v| !v.trim().is_empty()) {
            config.upstream = upstream;
        }
        config.upstream = normalize_upstream(&config.upstream)?;

        Ok(config)
    }

    /// Socket address string the relay listens on.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Trim a trailing slash and require an http(s) scheme.
fn normalize_upstream(upstream: &str) -> Result<String> {
    let trimmed = upstream.trim().trim_end_matches('/');
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(RelayError::ConfigError(format!(
            "{} must be an http:// or https:// URL, got '{}'",
            UPSTREAM_ENV, upstream
        )));
    }
    Ok(trimmed.to_string())
}

/// Local state layout: image store and build cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory (e.g., ~/.relaybox)
    pub root: PathBuf,

    /// Maximum total size of stored images in bytes
    pub max_image_bytes: u64,

    /// Maximum total size of the build cache in bytes
    pub max_cache_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_home(),
            max_image_bytes: 10 * 1024 * 1024 * 1024,
            max_cache_bytes: 5 * 1024 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Layout rooted at `RELAYBOX_HOME` when set, `~/.relaybox` otherwise.
    pub fn from_env() -> Self {
        match std::env::var(HOME_ENV) {
            Ok(root) if !root.trim().is_empty() => Self::with_root(PathBuf::from(root)),
            _ => Self::default(),
        }
    }

    /// Layout rooted at an explicit directory.
    pub fn with_root(root: PathBuf) -> Self {
        Self {
            root,
            ..Self::default()
        }
    }

    /// Directory of the image store.
    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    /// Directory of the build layer cache.
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache").join("build")
    }

    /// Directory holding scratch rootfs trees of running containers.
    pub fn containers_dir(&self) -> PathBuf {
        self.root.join("containers")
    }
}

fn default_home() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".relaybox"))
        .unwrap_or_else(|| PathBuf::from(".relaybox"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_proxy_config_defaults() {
        let config = ProxyConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.upstream, "http://localhost:9997");
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        assert_eq!(config.connect_timeout_secs, 10);
        assert_eq!(config.request_timeout_secs, 300);
    }

    #[test]
    fn test_proxy_config_port_override() {
        let config = ProxyConfig::from_lookup(lookup_from(&[("PORT", "9000")])).unwrap();
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn test_proxy_config_empty_port_uses_default() {
        let config = ProxyConfig::from_lookup(lookup_from(&[("PORT", "  ")])).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn test_proxy_config_invalid_port() {
        let err = ProxyConfig::from_lookup(lookup_from(&[("PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, RelayError::ConfigError(_)));

        let err = ProxyConfig::from_lookup(lookup_from(&[("PORT", "70000")])).unwrap_err();
        assert!(matches!(err, RelayError::ConfigError(_)));
    }

    #[test]
    fn test_proxy_config_upstream_trailing_slash() {
        let config = ProxyConfig::from_lookup(lookup_from(&[(
            "LLAMA_SERVER",
            "http://llama:9997/",
        )]))
        .unwrap();
        assert_eq!(config.upstream, "http://llama:9997");
    }

    #[test]
    fn test_proxy_config_upstream_requires_scheme() {
        let err =
            ProxyConfig::from_lookup(lookup_from(&[("LLAMA_SERVER", "llama:9997")])).unwrap_err();
        assert!(err.to_string().contains("LLAMA_SERVER"));
    }

    #[test]
    fn test_store_config_layout() {
        let config = StoreConfig::with_root(PathBuf::from("/var/lib/relaybox"));
        assert_eq!(config.images_dir(), PathBuf::from("/var/lib/relaybox/images"));
        assert_eq!(
            config.cache_dir(),
            PathBuf::from("/var/lib/relaybox/cache/build")
        );
        assert_eq!(
            config.containers_dir(),
            PathBuf::from("/var/lib/relaybox/containers")
        );
    }

    #[test]
    fn test_proxy_config_serde_roundtrip() {
        let config = ProxyConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ProxyConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.port, config.port);
        assert_eq!(parsed.upstream, config.upstream);
    }
}
