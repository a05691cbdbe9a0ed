use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use bounced::bootstrap::Server;
use bounced::config::Config;
use bounced::telemetry::{init_tracing, TracingConfig};

#[derive(Parser, Debug)]
#[command(name = "bounced")]
#[command(author, version, about = "Filtering reverse proxy for HTTP and TCP")]
struct Args {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Validate config and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration first (to get log settings)
    let config = Config::load(&args.config)?;

    init_tracing(&TracingConfig::from(&config.telemetry))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "starting bounced"
    );

    info!(
        proxies = config.proxies.len(),
        filters = config.filters.len(),
        "configuration loaded"
    );

    let server = Server::new(config, args.config)?;

    // Validate only mode
    if args.validate {
        server.validate()?;
        info!("configuration is valid");
        return Ok(());
    }

    server.run().await?;

    Ok(())
}
