mod commands;
mod config;

use clap::{Parser, Subcommand};
use cairn_core::Fault;
use commands::{
    backup::BackupCommand, check::CheckCommand, init::InitCommand, ls::LsCommand,
    restore::RestoreCommand, snapshots::SnapshotsCommand,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "cairn",
    version,
    about = "Encrypted incremental backups to an untrusted remote",
    long_about = "Cairn keeps a chain of full and incremental snapshots of a directory tree. \
                  Every snapshot is sealed with authenticated encryption before it leaves the machine."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, env = "CAIRN_STATE", help = "Local state directory")]
    state: Option<PathBuf>,

    #[arg(long, global = true, env = "CAIRN_REMOTE", help = "Remote directory")]
    remote: Option<PathBuf>,

    #[arg(long, global = true, env = "CAIRN_PASSWORD", hide_env_values = true, help = "Repository password")]
    password: Option<String>,

    #[arg(long, global = true, env = "CAIRN_KEY_FILE", help = "Read the repository secret from a file")]
    key_file: Option<PathBuf>,

    #[arg(long, global = true, env = "CAIRN_CONFIG", help = "Config file (TOML)")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, global = true, conflicts_with = "verbose", help = "Enable quiet mode")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Initialize a new backup set")]
    Init(InitCommand),

    #[command(about = "Create a new snapshot")]
    Backup(BackupCommand),

    #[command(about = "Restore a snapshot into an empty directory")]
    Restore(RestoreCommand),

    #[command(about = "List snapshots")]
    Snapshots(SnapshotsCommand),

    #[command(about = "List files in a snapshot")]
    Ls(LsCommand),

    #[command(about = "Verify every snapshot and look for orphan blobs")]
    Check(CheckCommand),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet);
    debug!("Starting cairn");

    let result = match cli.command {
        Commands::Init(ref cmd) => cmd.run(&cli).await,
        Commands::Backup(ref cmd) => cmd.run(&cli).await,
        Commands::Restore(ref cmd) => cmd.run(&cli).await,
        Commands::Snapshots(ref cmd) => cmd.run(&cli).await,
        Commands::Ls(ref cmd) => cmd.run(&cli).await,
        Commands::Check(ref cmd) => cmd.run(&cli).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(exit_code(&err))
        }
    }
}

/// Exit status by fault class; 2 is left to clap for usage errors.
fn exit_code(err: &anyhow::Error) -> u8 {
    let fault = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<cairn_core::Error>())
        .map(|e| e.fault());
    match fault {
        Some(Fault::Scan) => 3,
        Some(Fault::Storage) => 4,
        Some(Fault::Format) => 5,
        Some(Fault::Auth) => 6,
        Some(Fault::Chain) => 7,
        Some(Fault::Transport) => 8,
        Some(Fault::Other) | None => 1,
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(format!("cairn={}", level)))
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install log subscriber: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_cli_parses_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "cairn", "backup", "/data", "--exclude", "*.tmp", "--full", "--state", "/s", "-q",
        ]);
        assert_eq!(cli.state, Some(PathBuf::from("/s")));
        assert!(cli.quiet);
        assert!(matches!(cli.command, Commands::Backup(_)));
    }

    #[test]
    fn test_exit_code_follows_fault() {
        let err = anyhow::Error::from(cairn_core::Error::InvalidPassword);
        assert_eq!(exit_code(&err), 6);

        let wrapped: anyhow::Result<()> = Err(cairn_core::Error::Chain {
            reason: "gap".to_string(),
        })
        .context("restoring");
        assert_eq!(exit_code(&wrapped.unwrap_err()), 7);

        assert_eq!(exit_code(&anyhow::anyhow!("plain")), 1);
    }
}
