use super::{Settings, format_bytes, spinner};
use anyhow::{Result, bail};
use cairn_core::repository::BackupOptions;
use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct BackupCommand {
    #[arg(help = "Directory to back up")]
    path: PathBuf,

    #[arg(long, help = "Exclude pattern (gitignore syntax), may be repeated")]
    exclude: Vec<String>,

    #[arg(long, help = "Write a full snapshot regardless of the chain length")]
    full: bool,
}

impl BackupCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let settings = Settings::resolve(cli)?;
        if !self.path.is_dir() {
            bail!("Not a directory: {}", self.path.display());
        }
        let repo = settings.open().await?;

        let mut excludes = settings.config.excludes.clone();
        excludes.extend(self.exclude.iter().cloned());
        let options = BackupOptions {
            excludes,
            force_full: self.full,
        };

        let pb = spinner(cli.quiet, format!("Backing up {}...", self.path.display()));
        let result = repo.backup(&self.path, &options).await;
        pb.finish_and_clear();
        let report = result?;

        let snapshot = &report.snapshot;
        let stats = &snapshot.stats;
        println!("Snapshot {} saved", snapshot.summary());
        println!(
            "  Added: {}  Modified: {}  Removed: {}  Unchanged: {}",
            stats.added, stats.modified, stats.removed, stats.unchanged
        );
        println!(
            "  Data: {}  Archive: {}  Uploaded: {}",
            format_bytes(stats.bytes),
            format_bytes(report.archive_size),
            format_bytes(report.blob_size)
        );

        if !report.issues.is_empty() {
            println!("  Skipped {} path(s):", report.issues.len());
            for issue in &report.issues {
                println!("    {}: {}", issue.path, issue.reason);
            }
        }
        Ok(())
    }
}
