//! `drivesync status`: configuration and persisted sync state, read offline.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use drivesync_core::{config, store, Config, RemoteConfig};

/// Arguments for `drivesync status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home: PathBuf = dirs::home_dir().context("could not determine home directory")?;
        let report = build_report(&home)?;
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to render status JSON")?
            );
            return Ok(());
        }
        print_table(&report);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct StatusReport {
    root: String,
    remote: String,
    poll_interval_secs: u64,
    merge_interval_secs: u64,
    revision: u64,
    files: usize,
    directories: usize,
    synced_at: Option<DateTime<Utc>>,
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "setting")]
    key: &'static str,
    #[tabled(rename = "value")]
    value: String,
}

fn build_report(home: &Path) -> Result<StatusReport> {
    let cfg: Config =
        config::load_at(home).context("failed to load config, run `drivesync init` first")?;
    let state = store::load_file_at(home).context("failed to load sync state")?;

    let (revision, files, directories, synced_at) = match state {
        Some(state) => {
            let directories = state.entries.iter().filter(|e| e.is_dir).count();
            (
                state.revision,
                state.entries.len() - directories,
                directories,
                Some(state.synced_at),
            )
        }
        None => (0, 0, 0, None),
    };

    let remote = match &cfg.remote {
        RemoteConfig::Folder { path } => path.display().to_string(),
    };
    Ok(StatusReport {
        root: cfg.root.display().to_string(),
        remote,
        poll_interval_secs: cfg.poll_interval_secs,
        merge_interval_secs: cfg.merge_interval_secs,
        revision,
        files,
        directories,
        synced_at,
    })
}

fn print_table(report: &StatusReport) {
    let synced = match report.synced_at {
        Some(at) => format_age(at),
        None => "never".yellow().to_string(),
    };
    let rows = vec![
        StatusRow {
            key: "root",
            value: report.root.clone(),
        },
        StatusRow {
            key: "remote",
            value: report.remote.clone(),
        },
        StatusRow {
            key: "intervals",
            value: format!(
                "poll {}s, merge {}s",
                report.poll_interval_secs, report.merge_interval_secs
            ),
        },
        StatusRow {
            key: "revision",
            value: report.revision.to_string(),
        },
        StatusRow {
            key: "tracked",
            value: format!("{} files, {} directories", report.files, report.directories),
        },
        StatusRow {
            key: "last saved",
            value: synced,
        },
    ];

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn format_age(at: DateTime<Utc>) -> String {
    let secs = (Utc::now() - at).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
