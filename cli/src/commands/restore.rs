use super::{Settings, format_bytes, resolve_snapshot, spinner};
use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct RestoreCommand {
    #[arg(help = "Snapshot id, or \"latest\"")]
    snapshot: String,

    #[arg(help = "Target directory, absent or empty")]
    target: PathBuf,
}

impl RestoreCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let settings = Settings::resolve(cli)?;
        let repo = settings.open().await?;
        let id = resolve_snapshot(&repo, &self.snapshot).await?;

        let pb = spinner(cli.quiet, format!("Restoring snapshot {}...", id));
        let result = repo.restore(id, &self.target).await;
        pb.finish_and_clear();
        let report = result?;

        let chain: Vec<String> = report.chain.iter().map(|id| id.to_string()).collect();
        let stats = &report.stats;
        println!(
            "Restored snapshot {} to {}",
            report.snapshot,
            report.destination.display()
        );
        println!("  Replayed: {}", chain.join(" -> "));
        println!(
            "  Files: {}  Directories: {}  Symlinks: {}  Data: {}",
            stats.files,
            stats.directories,
            stats.symlinks,
            format_bytes(stats.bytes)
        );
        Ok(())
    }
}
