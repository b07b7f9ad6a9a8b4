//! Usage: Vault settings schema (defaults, sanitize/validate, plaintext `settings.json` mirror).

use crate::domain::accounts::OAuthProvider;
use crate::shared::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_QUOTA_REFRESH_INTERVAL_SECONDS: u32 = 300;
pub const MIN_QUOTA_REFRESH_INTERVAL_SECONDS: u32 = 60;
pub const MAX_QUOTA_REFRESH_INTERVAL_SECONDS: u32 = 24 * 60 * 60;
pub const DEFAULT_QUOTA_ALERT_THRESHOLD: f64 = 0.9;
pub const DEFAULT_MAX_BACKUPS: u32 = 10;
const MAX_MAX_BACKUPS: u32 = 100;
pub const DEFAULT_BACKUP_RETENTION_DAYS: u32 = 30;
const MAX_BACKUP_RETENTION_DAYS: u32 = 3650;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VaultSettings {
    pub schema_version: u32,
    pub quota_refresh_interval: u32,
    pub auto_refresh_quota: bool,
    pub quota_alert_threshold: f64,
    #[serde(rename = "preferredOAuthProvider")]
    pub preferred_oauth_provider: OAuthProvider,
    pub export_encryption: bool,
    pub auto_backup: bool,
    pub max_backups: u32,
    pub backup_retention_days: u32,
    pub auto_change_machine_id: bool,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            quota_refresh_interval: DEFAULT_QUOTA_REFRESH_INTERVAL_SECONDS,
            auto_refresh_quota: true,
            quota_alert_threshold: DEFAULT_QUOTA_ALERT_THRESHOLD,
            preferred_oauth_provider: OAuthProvider::Google,
            export_encryption: true,
            auto_backup: true,
            max_backups: DEFAULT_MAX_BACKUPS,
            backup_retention_days: DEFAULT_BACKUP_RETENTION_DAYS,
            auto_change_machine_id: false,
        }
    }
}

/// Backup rotation knobs handed to the encrypted store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupPolicy {
    pub enabled: bool,
    pub max_backups: usize,
    pub retention_days: u32,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        VaultSettings::default().backup_policy()
    }
}

impl VaultSettings {
    pub fn backup_policy(&self) -> BackupPolicy {
        BackupPolicy {
            enabled: self.auto_backup,
            max_backups: self.max_backups.max(1) as usize,
            retention_days: self.backup_retention_days,
        }
    }

    /// Clamps loaded values into range. Returns whether anything changed.
    pub fn sanitize(&mut self) -> bool {
        let mut changed = false;

        if self.schema_version != SCHEMA_VERSION {
            self.schema_version = SCHEMA_VERSION;
            changed = true;
        }

        let interval = self.quota_refresh_interval.clamp(
            MIN_QUOTA_REFRESH_INTERVAL_SECONDS,
            MAX_QUOTA_REFRESH_INTERVAL_SECONDS,
        );
        if interval != self.quota_refresh_interval {
            self.quota_refresh_interval = interval;
            changed = true;
        }

        if !self.quota_alert_threshold.is_finite() {
            self.quota_alert_threshold = DEFAULT_QUOTA_ALERT_THRESHOLD;
            changed = true;
        } else if !(0.0..=1.0).contains(&self.quota_alert_threshold) {
            self.quota_alert_threshold = self.quota_alert_threshold.clamp(0.0, 1.0);
            changed = true;
        }

        let max_backups = self.max_backups.clamp(1, MAX_MAX_BACKUPS);
        if max_backups != self.max_backups {
            self.max_backups = max_backups;
            changed = true;
        }

        if self.backup_retention_days > MAX_BACKUP_RETENTION_DAYS {
            self.backup_retention_days = MAX_BACKUP_RETENTION_DAYS;
            changed = true;
        }

        changed
    }

    /// Strict check used for user-supplied updates.
    pub fn validate(&self) -> AppResult<()> {
        if !(MIN_QUOTA_REFRESH_INTERVAL_SECONDS..=MAX_QUOTA_REFRESH_INTERVAL_SECONDS)
            .contains(&self.quota_refresh_interval)
        {
            return Err(AppError::invalid_input(format!(
                "quotaRefreshInterval must be within {MIN_QUOTA_REFRESH_INTERVAL_SECONDS}..={MAX_QUOTA_REFRESH_INTERVAL_SECONDS} seconds"
            )));
        }
        if !self.quota_alert_threshold.is_finite()
            || !(0.0..=1.0).contains(&self.quota_alert_threshold)
        {
            return Err(AppError::invalid_input(
                "quotaAlertThreshold must be a fraction between 0 and 1",
            ));
        }
        if self.max_backups == 0 || self.max_backups > MAX_MAX_BACKUPS {
            return Err(AppError::invalid_input(format!(
                "maxBackups must be within 1..={MAX_MAX_BACKUPS}"
            )));
        }
        if self.backup_retention_days > MAX_BACKUP_RETENTION_DAYS {
            return Err(AppError::invalid_input(format!(
                "backupRetentionDays must be <= {MAX_BACKUP_RETENTION_DAYS}"
            )));
        }
        Ok(())
    }
}

pub fn read_settings_file(path: &Path) -> AppResult<Option<VaultSettings>> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(AppError::persistence(format!(
                "failed to read {}: {err}",
                path.display()
            )))
        }
    };
    let mut settings: VaultSettings = serde_json::from_slice(&content)
        .map_err(|e| AppError::persistence(format!("invalid settings.json: {e}")))?;
    if settings.sanitize() {
        tracing::debug!(path = %path.display(), "settings.json sanitized on read");
    }
    Ok(Some(settings))
}

pub fn write_settings_file(path: &Path, settings: &VaultSettings) -> AppResult<()> {
    let content = serde_json::to_vec_pretty(settings)
        .map_err(|e| AppError::persistence(format!("failed to serialize settings: {e}")))?;
    crate::infra::store::write_atomic(path, &content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = VaultSettings::default();
        assert_eq!(settings.quota_refresh_interval, 300);
        assert!(settings.auto_refresh_quota);
        assert!((settings.quota_alert_threshold - 0.9).abs() < f64::EPSILON);
        assert_eq!(settings.preferred_oauth_provider, OAuthProvider::Google);
        assert!(settings.export_encryption);
        assert_eq!(settings.max_backups, 10);
        assert_eq!(settings.backup_retention_days, 30);
        assert!(!settings.auto_change_machine_id);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let mut settings = VaultSettings {
            quota_refresh_interval: 5,
            quota_alert_threshold: 1.7,
            max_backups: 0,
            ..VaultSettings::default()
        };
        assert!(settings.sanitize());
        assert_eq!(settings.quota_refresh_interval, MIN_QUOTA_REFRESH_INTERVAL_SECONDS);
        assert!((settings.quota_alert_threshold - 1.0).abs() < f64::EPSILON);
        assert_eq!(settings.max_backups, 1);
        assert!(!settings.sanitize());
    }

    #[test]
    fn sanitize_resets_nan_threshold() {
        let mut settings = VaultSettings {
            quota_alert_threshold: f64::NAN,
            ..VaultSettings::default()
        };
        assert!(settings.sanitize());
        assert!((settings.quota_alert_threshold - DEFAULT_QUOTA_ALERT_THRESHOLD).abs() < 1e-9);
    }

    #[test]
    fn validate_rejects_bad_threshold() {
        let settings = VaultSettings {
            quota_alert_threshold: -0.1,
            ..VaultSettings::default()
        };
        let err = settings.validate().expect_err("threshold");
        assert_eq!(err.code(), "SEC_INVALID_INPUT");
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let settings: VaultSettings =
            serde_json::from_str(r#"{"autoBackup":false,"preferredOAuthProvider":"github"}"#)
                .expect("parse");
        assert!(!settings.auto_backup);
        assert_eq!(settings.preferred_oauth_provider, OAuthProvider::Github);
        assert_eq!(settings.max_backups, DEFAULT_MAX_BACKUPS);
    }

    #[test]
    fn retired_display_keys_are_ignored_on_load() {
        let settings: VaultSettings = serde_json::from_str(
            r#"{"showQuotaInStatusBar":false,"defaultLoginMethod":"token","maxBackups":4}"#,
        )
        .expect("parse");
        assert_eq!(settings.max_backups, 4);
        let text = serde_json::to_string(&settings).expect("json");
        assert!(!text.contains("showQuotaInStatusBar"));
        assert!(!text.contains("defaultLoginMethod"));
    }

    #[test]
    fn settings_file_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        assert!(read_settings_file(&path).expect("read missing").is_none());

        let settings = VaultSettings {
            quota_refresh_interval: 600,
            ..VaultSettings::default()
        };
        write_settings_file(&path, &settings).expect("write");
        assert_eq!(read_settings_file(&path).expect("read"), Some(settings));
    }
}
