//! Usage: Resolve the vault data directory and its well-known files (supports $KIRO_VAULT_HOME).

use crate::shared::error::{AppError, AppResult};
use std::path::{Path, PathBuf};

pub const ENV_VAULT_HOME: &str = "KIRO_VAULT_HOME";
const DEFAULT_DIR_NAME: &str = ".kiro-vault";

pub const ACCOUNTS_FILE_NAME: &str = "accounts.json.enc";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const TAGS_FILE_NAME: &str = "tags.json";
pub const MASTER_KEY_FILE_NAME: &str = "master.key";
pub const BACKUPS_DIR_NAME: &str = "backups";
pub const LOGS_DIR_NAME: &str = "logs";

fn expand_tilde(home: &Path, raw: &str) -> Option<PathBuf> {
    let trimmed = raw.trim();
    if trimmed == "~" {
        return Some(home.to_path_buf());
    }

    let rest = trimmed
        .strip_prefix("~/")
        .or_else(|| trimmed.strip_prefix("~\\"));

    rest.map(|suffix| home.join(suffix))
}

fn resolve_under_home(home: &Path, raw: &str) -> PathBuf {
    if let Some(p) = expand_tilde(home, raw) {
        return p;
    }

    let candidate = PathBuf::from(raw.trim());
    if candidate.is_absolute() {
        return candidate;
    }

    home.join(candidate)
}

/// `--data-dir` wins, then `$KIRO_VAULT_HOME`, then `~/.kiro-vault`.
pub fn resolve_data_dir(explicit: Option<&Path>) -> AppResult<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }

    let home = dirs::home_dir()
        .ok_or_else(|| AppError::new("SYSTEM_ERROR", "failed to resolve home dir"))?;
    let raw = std::env::var(ENV_VAULT_HOME)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    Ok(match raw {
        Some(v) => resolve_under_home(&home, &v),
        None => home.join(DEFAULT_DIR_NAME),
    })
}

pub fn ensure_dir(dir: &Path) -> AppResult<()> {
    std::fs::create_dir_all(dir).map_err(|e| {
        AppError::persistence(format!("failed to create {}: {e}", dir.display()))
    })
}

/// Fixed file layout inside one data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultPaths {
    pub data_dir: PathBuf,
}

impl VaultPaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn accounts_file(&self) -> PathBuf {
        self.data_dir.join(ACCOUNTS_FILE_NAME)
    }

    pub fn settings_file(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE_NAME)
    }

    pub fn tags_file(&self) -> PathBuf {
        self.data_dir.join(TAGS_FILE_NAME)
    }

    pub fn master_key_file(&self) -> PathBuf {
        self.data_dir.join(MASTER_KEY_FILE_NAME)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join(BACKUPS_DIR_NAME)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join(LOGS_DIR_NAME)
    }
}
