use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod logging;

/// A local interactive shell, bridged to a paired browser over a public
/// tunnel.
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
pub struct Cli {
    /// Path to the daemon's YAML configuration file.
    #[clap(long, short, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Increase log verbosity (-d, -dd for more).
    #[clap(long, short, action = clap::ArgAction::Count)]
    pub debug: u8,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the bridge daemon in the foreground.
    Run,
    /// Approve a pending first-time pairing by its key id.
    Approve {
        kid: String,
    },
    /// Print the running daemon's status.
    Status,
    /// Generate a fresh RSA client keypair for pairing with the daemon.
    Keygen,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run => commands::run::command(&cli).await,
        Commands::Approve { kid } => commands::approve::command(&cli, kid).await,
        Commands::Status => commands::status::command(&cli).await,
        Commands::Keygen => commands::keygen::command().await,
    }
}
