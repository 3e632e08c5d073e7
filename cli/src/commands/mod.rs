pub mod backup;
pub mod check;
pub mod init;
pub mod ls;
pub mod restore;
pub mod snapshots;

use crate::config::Config;
use anyhow::{Context, Result, anyhow, bail};
use cairn_backends::{LocalBackend, RetryingBackend};
use cairn_core::crypto::Secret;
use cairn_core::{Backend, Repository, SnapshotId};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Global flags merged over the config file.
pub struct Settings {
    pub state: PathBuf,
    pub remote: PathBuf,
    pub password: Option<String>,
    pub key_file: Option<PathBuf>,
    pub config: Config,
}

impl Settings {
    pub fn resolve(cli: &crate::Cli) -> Result<Self> {
        let config = Config::load(cli.config.as_deref())?;
        Self::merge(cli, config)
    }

    fn merge(cli: &crate::Cli, config: Config) -> Result<Self> {
        let state = cli
            .state
            .clone()
            .or_else(|| config.state.clone())
            .ok_or_else(|| anyhow!("State directory required (--state or CAIRN_STATE)"))?;
        let remote = cli
            .remote
            .clone()
            .or_else(|| config.remote.clone())
            .ok_or_else(|| anyhow!("Remote directory required (--remote or CAIRN_REMOTE)"))?;
        let key_file = cli.key_file.clone().or_else(|| config.key_file.clone());

        Ok(Self {
            state,
            remote,
            password: cli.password.clone(),
            key_file,
            config,
        })
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        Arc::new(RetryingBackend::new(
            LocalBackend::new(&self.remote),
            self.config.retry.to_retry_config(),
        ))
    }

    /// Key file first, then `--password`, then an interactive prompt.
    pub fn secret(&self, confirm: bool) -> Result<Secret> {
        if let Some(path) = &self.key_file {
            return read_key_file(path);
        }
        if let Some(password) = &self.password {
            return non_empty(Secret::from_passphrase(password.clone()));
        }

        let password = prompt("Enter repository password: ")?;
        if confirm && prompt("Confirm repository password: ")? != password {
            bail!("Passwords do not match");
        }
        non_empty(Secret::from_passphrase(password))
    }

    pub async fn open(&self) -> Result<Repository> {
        let secret = self.secret(false)?;
        info!(state = %self.state.display(), remote = %self.remote.display(), "Opening repository");
        let repo = Repository::open(&self.state, self.backend(), &secret).await?;
        Ok(repo)
    }
}

fn prompt(message: &str) -> Result<String> {
    print!("{}", message);
    io::stdout().flush()?;
    rpassword::read_password().context("Failed to read password")
}

fn non_empty(secret: Secret) -> Result<Secret> {
    if secret.is_empty() {
        bail!("Password must not be empty");
    }
    Ok(secret)
}

/// The whole file is the secret, minus one trailing newline.
fn read_key_file(path: &Path) -> Result<Secret> {
    let mut bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read key file {}", path.display()))?;
    if bytes.last() == Some(&b'\n') {
        bytes.pop();
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
    }
    non_empty(Secret::from_bytes(bytes))
}

/// `latest` or a numeric snapshot id.
pub async fn resolve_snapshot(repo: &Repository, arg: &str) -> Result<SnapshotId> {
    if arg.eq_ignore_ascii_case("latest") {
        let snapshots = repo.snapshots().await?;
        return snapshots
            .last()
            .map(|s| s.id)
            .ok_or_else(|| anyhow!("Repository has no snapshots yet"));
    }
    arg.parse::<SnapshotId>()
        .map_err(|_| anyhow!("Invalid snapshot id {:?}: expected a number or \"latest\"", arg))
}

pub fn spinner(quiet: bool, message: impl Into<String>) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.into());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    #[test]
    fn test_flags_override_config() {
        let cli = crate::Cli::parse_from(["cairn", "--state", "/flag/state", "snapshots"]);
        let config = Config {
            state: Some(PathBuf::from("/config/state")),
            remote: Some(PathBuf::from("/config/remote")),
            ..Default::default()
        };
        let settings = Settings::merge(&cli, config).unwrap();
        assert_eq!(settings.state, PathBuf::from("/flag/state"));
        assert_eq!(settings.remote, PathBuf::from("/config/remote"));
    }

    #[test]
    fn test_missing_remote_is_an_error() {
        let cli = crate::Cli::parse_from(["cairn", "--state", "/s", "snapshots"]);
        let err = Settings::merge(&cli, Config::default()).err().unwrap();
        assert!(err.to_string().contains("--remote"));
    }

    #[test]
    fn test_key_file_wins_over_password() {
        let dir = TempDir::new().unwrap();
        let key = dir.path().join("key");
        std::fs::write(&key, "from-file\n").unwrap();

        let settings = Settings {
            state: dir.path().join("state"),
            remote: dir.path().join("remote"),
            password: Some("from-flag".to_string()),
            key_file: Some(key),
            config: Config::default(),
        };
        assert_eq!(settings.secret(false).unwrap().expose(), b"from-file");
    }

    #[test]
    fn test_empty_key_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let key = dir.path().join("key");
        std::fs::write(&key, "\n").unwrap();
        assert!(read_key_file(&key).is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MiB");
    }
}
