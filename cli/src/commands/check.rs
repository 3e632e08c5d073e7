use super::{Settings, spinner};
use anyhow::{Result, bail};
use clap::Args;

#[derive(Args)]
pub struct CheckCommand {
    #[arg(long, help = "Delete remote blobs no snapshot refers to")]
    remove_orphans: bool,
}

impl CheckCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let settings = Settings::resolve(cli)?;
        let repo = settings.open().await?;

        let pb = spinner(cli.quiet, "Verifying snapshots...");
        let result = repo.check(self.remove_orphans).await;
        pb.finish_and_clear();
        let report = result?;

        println!("Verified {} snapshot(s)", report.verified.len());
        for orphan in &report.orphans {
            if report.removed.contains(orphan) {
                println!("  Removed orphan blob {}", orphan);
            } else {
                println!("  Orphan blob {} (use --remove-orphans to delete)", orphan);
            }
        }
        for failure in &report.failures {
            println!(
                "  FAILED snapshot {} ({}): {}",
                failure.snapshot, failure.blob_id, failure.error
            );
        }

        if !report.is_ok() {
            bail!("{} snapshot(s) failed verification", report.failures.len());
        }
        Ok(())
    }
}
