use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "forge-hdr")]
#[command(about = "Cluster self-management control plane")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Path to a YAML/JSON configuration file. Falls back to built-in
    /// defaults for any field it doesn't set.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate configuration without starting any background loop.
    Check,

    /// Start the supervisor, every periodic loop, and the metrics/health
    /// server.
    Serve {
        /// Run against an in-memory cluster client instead of a live
        /// cluster (there is no live adapter wired into this binary; see
        /// `cluster_client::ClusterClient`'s doc comment for how to add one).
        #[arg(long, default_value_t = true)]
        dry_run: bool,
    },
}
