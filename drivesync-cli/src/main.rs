//! drivesync: keep a local directory and a remote tree in sync.
//!
//! # Usage
//!
//! ```text
//! drivesync init <root> --remote <dir> [--poll-interval N] [--merge-interval N]
//! drivesync status [--json]
//! drivesync daemon start|stop|status|sync
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{daemon::DaemonCommand, init::InitArgs, status::StatusArgs};

#[derive(Parser, Debug)]
#[command(
    name = "drivesync",
    version,
    about = "Bidirectional sync between a local directory and a remote tree",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write the configuration for a synced root.
    Init(InitArgs),

    /// Show configuration and persisted sync state.
    Status(StatusArgs),

    /// Run or control the sync daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
