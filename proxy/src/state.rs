use std::sync::Arc;
use std::time::Duration;

use relaybox_core::config::ProxyConfig;
use relaybox_core::error::{RelayError, Result};

/// Shared relay state: configuration plus the two upstream clients.
pub struct AppState {
    pub config: ProxyConfig,
    /// Buffered requests: whole-request timeout, redirects returned as-is
    pub buffered: reqwest::Client,
    /// Streaming requests: connect timeout only
    pub streaming: reqwest::Client,
}

impl AppState {
    pub fn new(config: ProxyConfig) -> Result<Arc<Self>> {
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);

        let buffered = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| RelayError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        let streaming = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| RelayError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Arc::new(Self {
            config,
            buffered,
            streaming,
        }))
    }

    /// Upstream URL for a request path and raw query string.
    pub fn target_url(&self, path: &str, query: Option<&str>) -> String {
        let mut url = format!(
            "{}/{}",
            self.config.upstream,
            path.trim_start_matches('/')
        );
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        url
    }
}
