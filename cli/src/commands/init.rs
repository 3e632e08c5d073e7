use super::Settings;
use anyhow::Result;
use cairn_core::Repository;
use cairn_core::repository::RepoOptions;
use clap::Args;
use tracing::info;

#[derive(Args)]
pub struct InitCommand {
    #[arg(long, help = "Write a full snapshot every N backups")]
    full_every: Option<u32>,

    #[arg(long, help = "Store archives without compression")]
    no_compression: bool,
}

impl InitCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let settings = Settings::resolve(cli)?;
        let options = self.options(&settings);
        let secret = settings.secret(true)?;

        info!(state = %settings.state.display(), remote = %settings.remote.display(), "Initializing repository");
        let repo = Repository::init(&settings.state, settings.backend(), &secret, options).await?;

        let config = repo.config();
        println!("Initialized backup set {}", config.id);
        println!("  State:       {}", settings.state.display());
        println!("  Remote:      {}", settings.remote.display());
        println!("  Full every:  {} backups", config.full_every);
        println!("  Compression: {}", if config.compression { "on" } else { "off" });
        println!();
        println!("Losing the password makes every snapshot unrecoverable.");
        Ok(())
    }

    fn options(&self, settings: &Settings) -> RepoOptions {
        let defaults = RepoOptions::default();
        RepoOptions {
            full_every: self
                .full_every
                .or(settings.config.full_every)
                .unwrap_or(defaults.full_every),
            compression: !self.no_compression
                && settings.config.compression.unwrap_or(defaults.compression),
            ..defaults
        }
    }
}
