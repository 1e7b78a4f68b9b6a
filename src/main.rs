mod cli;
mod commands;

use std::fs;

use clap::Parser;
use cli::{Cli, Commands};
use forge_hdr::config::Config;
use tracing_subscriber::EnvFilter;

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<Config> {
    match path {
        None => Ok(Config::default()),
        Some(path) => {
            let raw = fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;
            let config: Config = serde_yaml::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;
            Ok(config)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Check => commands::check::run(&config)?,
        Commands::Serve { dry_run } => commands::serve::run(config, dry_run).await?,
    }

    Ok(())
}
