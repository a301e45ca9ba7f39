//! `uira-ollama-proxy` binary entrypoint.
//!
//! Configuration comes from environment variables, optionally overlaid by a
//! YAML file and finally by command-line flags.

use clap::Parser;
use std::path::PathBuf;
use uira_ollama_proxy::{serve, ProxyConfig};

/// Serve the Ollama API on top of an OpenAI-compatible backend
#[derive(Parser, Debug)]
#[command(name = "uira-ollama-proxy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// YAML config file with a `proxy:` section
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port (overrides PORT and the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Backend base URL (overrides BACKEND_BASE_URL and the config file)
    #[arg(long)]
    backend_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Respect `RUST_LOG` if set; otherwise default to proxy-friendly info.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ProxyConfig::from_yaml_file(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(url) = cli.backend_url {
        config.backend_base_url = url;
    }

    serve(config).await
}
