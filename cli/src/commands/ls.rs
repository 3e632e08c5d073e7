use super::{Settings, resolve_snapshot};
use anyhow::Result;
use cairn_core::FileKind;
use clap::Args;

#[derive(Args)]
pub struct LsCommand {
    #[arg(help = "Snapshot id, or \"latest\"")]
    snapshot: String,

    #[arg(long, help = "Print the manifest as JSON")]
    json: bool,
}

impl LsCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let settings = Settings::resolve(cli)?;
        let repo = settings.open().await?;
        let id = resolve_snapshot(&repo, &self.snapshot).await?;
        let manifest = repo.list_files(id).await?;

        if self.json {
            let records: Vec<_> = manifest.live().collect();
            println!("{}", serde_json::to_string_pretty(&records)?);
            return Ok(());
        }

        for record in manifest.live() {
            match record.kind {
                FileKind::File => println!("{:o} {:>12}  {}", record.mode, record.size, record.path),
                FileKind::Directory => println!("{:o} {:>12}  {}/", record.mode, "-", record.path),
                FileKind::Symlink => println!(
                    "{:o} {:>12}  {} -> {}",
                    record.mode,
                    "-",
                    record.path,
                    record.link_target.as_deref().unwrap_or("")
                ),
                FileKind::Tombstone => {}
            }
        }
        println!(
            "{} files, {} directories",
            manifest.file_count(),
            manifest.dir_count()
        );
        Ok(())
    }
}
