use super::Settings;
use anyhow::Result;
use cairn_core::SnapshotKind;
use clap::{Args, ValueEnum};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Args)]
pub struct SnapshotsCommand {
    #[arg(long, value_enum, default_value_t = OutputFormat::Table, help = "Output format")]
    format: OutputFormat,
}

impl SnapshotsCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let settings = Settings::resolve(cli)?;
        let repo = settings.open().await?;
        let snapshots = repo.snapshots().await?;

        match self.format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&snapshots)?);
            }
            OutputFormat::Table => {
                if snapshots.is_empty() {
                    println!("No snapshots found");
                    return Ok(());
                }
                println!(
                    "{:<8} {:<8} {:<12} {:<20} {:<15} {:>6} {:>6} {:>6}  {}",
                    "ID", "Parent", "Kind", "Date", "Host", "Added", "Mod", "Del", "Source"
                );
                println!("{:-<100}", "");
                for snapshot in &snapshots {
                    let parent = snapshot
                        .parent
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    let kind = match snapshot.kind {
                        SnapshotKind::Full => "full",
                        SnapshotKind::Incremental => "incremental",
                    };
                    println!(
                        "{:<8} {:<8} {:<12} {:<20} {:<15} {:>6} {:>6} {:>6}  {}",
                        snapshot.id,
                        parent,
                        kind,
                        snapshot.time.format("%Y-%m-%d %H:%M:%S"),
                        snapshot.hostname,
                        snapshot.stats.added,
                        snapshot.stats.modified,
                        snapshot.stats.removed,
                        snapshot.source.display()
                    );
                }
            }
        }
        Ok(())
    }
}
