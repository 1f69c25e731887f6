//! relaybox CLI entry point.

use clap::Parser;

use relaybox_cli::commands::{dispatch, Cli, Command};
use relaybox_core::{init_tracing, LogFormat};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // The relay is a long-running service; everything else stays quiet
    let default_level = match cli.command {
        Command::Serve(_) => "info",
        _ => "warn",
    };
    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    init_tracing(default_level, format);

    if let Err(e) = dispatch(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
