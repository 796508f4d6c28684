use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use pulsedb::{config, logging, server};

#[derive(Parser)]
#[command(author, version, about = "pulsedb activity-tracking server")]
struct Cli {
    /// Path to the configuration file. Defaults to ~/.pulsedb/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the pulsedb server
    Start(StartArgs),
}

#[derive(Args)]
struct StartArgs {
    /// Override the configured listen port
    #[arg(long)]
    port: Option<u16>,

    /// Mark this instance as a testing server
    #[arg(long)]
    testing: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { config, command } = Cli::parse();

    match command {
        Commands::Start(args) => {
            let (mut cfg, _path) = config::load_or_default(config)?;
            if let Some(port) = args.port {
                cfg.port = port;
            }
            if args.testing {
                cfg.testing = true;
            }
            logging::init(Some(&cfg.log_dir()))?;
            server::run(cfg).await?;
        }
    }

    Ok(())
}
