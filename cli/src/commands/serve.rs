//! `relaybox serve` command - run the streaming relay.

use clap::Args;
use relaybox_core::config::{ProxyConfig, PORT_ENV, UPSTREAM_ENV};

#[derive(Args)]
pub struct ServeArgs {
    /// Port to listen on (overrides PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// llama.cpp server base URL (overrides LLAMA_SERVER)
    #[arg(short, long)]
    pub upstream: Option<String>,

    /// Interface to bind
    #[arg(long)]
    pub host: Option<String>,
}

pub async fn execute(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(&args, |key| std::env::var(key).ok())?;
    println!("Forwarding requests to: {}", config.upstream);
    println!("Relay available at: http://{}", config.bind_addr());
    relaybox_proxy::serve(config).await?;
    Ok(())
}

/// Flags take precedence over the environment.
fn resolve_config<F>(
    args: &ServeArgs,
    env: F,
) -> Result<ProxyConfig, relaybox_core::RelayError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = ProxyConfig::from_lookup(|key| match key {
        PORT_ENV => args.port.map(|p| p.to_string()).or_else(|| env(key)),
        UPSTREAM_ENV => args.upstream.clone().or_else(|| env(key)),
        _ => env(key),
    })?;
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    Ok(config)
}
