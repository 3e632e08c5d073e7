//! Optional TOML configuration for the `cairn` binary.
//!
//! Values from the file are defaults; command-line flags and environment
//! variables take precedence.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Local state directory of the backup set
    pub state: Option<PathBuf>,

    /// Directory used as the remote store
    pub remote: Option<PathBuf>,

    /// File whose contents are the backup set secret
    pub key_file: Option<PathBuf>,

    /// Exclude patterns applied to every backup (gitignore syntax)
    pub excludes: Vec<String>,

    /// Used by `init` only
    pub full_every: Option<u32>,

    /// Used by `init` only
    pub compression: Option<bool>,

    pub retry: RetrySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> cairn_backends::RetryConfig {
        cairn_backends::RetryConfig {
            max_attempts: self.max_attempts.max(1),
            initial_backoff: std::time::Duration::from_millis(self.initial_backoff_ms),
            max_backoff: std::time::Duration::from_millis(self.max_backoff_ms),
            ..Default::default()
        }
    }
}

/// `$XDG_CONFIG_HOME/cairn/config.toml` or the platform equivalent.
pub fn default_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "cairn").map(|dirs| dirs.config_dir().join("config.toml"))
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Loads `explicit` if given, which must exist. Otherwise loads the default
    /// location when present and falls back to built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        match default_path() {
            Some(path) if path.is_file() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_toml(
            r#"
            state = "/var/lib/cairn/home"
            remote = "/mnt/offsite/home"
            excludes = ["*.tmp", "target/"]
            full_every = 14

            [retry]
            max_attempts = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.state, Some(PathBuf::from("/var/lib/cairn/home")));
        assert_eq!(config.remote, Some(PathBuf::from("/mnt/offsite/home")));
        assert_eq!(config.excludes, vec!["*.tmp", "target/"]);
        assert_eq!(config.full_every, Some(14));
        assert_eq!(config.compression, None);
        assert_eq!(config.retry.max_attempts, 8);
        assert_eq!(config.retry.initial_backoff_ms, 100);
    }

    #[test]
    fn test_empty_config_is_default() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(Config::from_toml("pasword = \"oops\"").is_err());
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let dir = TempDir::new().unwrap();
        assert!(Config::load(Some(&dir.path().join("missing.toml"))).is_err());

        let path = dir.path().join("cairn.toml");
        std::fs::write(&path, "compression = false\n").unwrap();
        assert_eq!(Config::load(Some(&path)).unwrap().compression, Some(false));
    }
}
