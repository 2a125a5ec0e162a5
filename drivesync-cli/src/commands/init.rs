//! `drivesync init <root> --remote <dir>`

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use drivesync_core::{config, Config, RemoteConfig};

/// Write `~/.drivesync/config.yaml` for a synced root.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Local directory to keep in sync. Created if missing.
    pub root: PathBuf,

    /// Directory holding the remote tree (usually a mounted share).
    #[arg(long, short = 'r')]
    pub remote: PathBuf,

    /// Seconds between remote polls.
    #[arg(long, value_name = "SECS")]
    pub poll_interval: Option<u64>,

    /// Seconds between merge iterations.
    #[arg(long, value_name = "SECS")]
    pub merge_interval: Option<u64>,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = dirs::home_dir().context("could not determine home directory")?;

        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("cannot create '{}'", self.root.display()))?;
        let root = self
            .root
            .canonicalize()
            .with_context(|| format!("cannot resolve path '{}'", self.root.display()))?;
        std::fs::create_dir_all(&self.remote)
            .with_context(|| format!("cannot create '{}'", self.remote.display()))?;
        let remote = self
            .remote
            .canonicalize()
            .with_context(|| format!("cannot resolve path '{}'", self.remote.display()))?;
        if remote.starts_with(&root) || root.starts_with(&remote) {
            anyhow::bail!(
                "root '{}' and remote '{}' must not contain each other",
                root.display(),
                remote.display()
            );
        }

        let mut cfg = Config::new(root.clone(), RemoteConfig::Folder { path: remote.clone() });
        if let Some(secs) = self.poll_interval {
            cfg.poll_interval_secs = secs;
        }
        if let Some(secs) = self.merge_interval {
            cfg.merge_interval_secs = secs;
        }
        config::save_at(&home, &cfg)
            .with_context(|| format!("failed to init '{}'", root.display()))?;

        println!("{} Syncing '{}'", "✓".green(), root.display());
        println!("  Remote:   {}", remote.display());
        println!(
            "  Saved to: {}",
            config::config_path_at(&home).display()
        );
        Ok(())
    }
}
