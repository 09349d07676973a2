//! Server entry point.
//!
//! Loads settings (TOML file + `TAGGER_RPC_` environment overrides), applies
//! CLI overrides, and serves the adapter layer over the simulated native
//! library.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use tagger_rpc::config::Settings;
use tagger_rpc::native::sim::SimLibrary;
use tagger_rpc::native::NativeLibrary;
use tagger_rpc::server;

#[derive(Parser, Debug)]
#[command(name = "tagger_rpc_server", about = "Remote adapter server for time-tagger hardware")]
struct Cli {
    /// Listen address override.
    #[arg(long)]
    host: Option<String>,

    /// Listen port override.
    #[arg(long)]
    port: Option<u16>,

    /// Path to the TOML configuration file.
    #[arg(long, default_value = tagger_rpc::config::DEFAULT_CONFIG_FILE)]
    config: String,

    /// Shorthand for a debug-level log filter.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;
    if let Some(host) = cli.host {
        settings.server.host = host;
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if cli.verbose {
        settings.log.filter = "debug".to_string();
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&settings.log.filter)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let native: Arc<dyn NativeLibrary> = Arc::new(SimLibrary::new());
    server::serve(settings, native).await
}
