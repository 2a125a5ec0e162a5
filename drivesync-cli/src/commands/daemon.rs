//! `drivesync daemon`: run the sync loop or talk to a running one.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde_json::Value;

use drivesync_daemon::paths::socket_path;
use drivesync_daemon::{request_status, request_stop, request_sync, start_blocking, DaemonError};

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground.
    Start,
    /// Request graceful shutdown over the control socket.
    Stop,
    /// Query the running daemon.
    Status,
    /// Poll the remote and merge now.
    Sync,
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let home = dirs::home_dir().context("could not determine home directory")?;

    match command {
        DaemonCommand::Start => {
            start_blocking(&home).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match request_stop(&home) {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("daemon is not running");
            }
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status => match request_status(&home) {
            Ok(status) => print_json(&status)?,
            Err(DaemonError::DaemonNotRunning { .. }) => {
                print_json(&serde_json::json!({
                    "running": false,
                    "socket": socket_path(&home).display().to_string(),
                }))?;
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        },
        DaemonCommand::Sync => {
            let summary = request_sync(&home).context("failed to run sync")?;
            if summary.is_null() {
                println!("a merge was already running, skipped");
            } else {
                print_json(&summary)?;
            }
        }
    }

    Ok(())
}

fn print_json(value: &Value) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render daemon JSON")?
    );
    Ok(())
}
