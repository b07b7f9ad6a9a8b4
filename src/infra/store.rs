//! Usage: Encrypted on-disk snapshot store with rotating backups and plaintext operability mirrors.
//!
//! Layout under the data dir:
//! - `accounts.json.enc`                     encrypted registry snapshot (tokens included)
//! - `backups/accounts_<ts>.json.enc`        rotated copies of the primary file
//! - `settings.json` / `tags.json`           plaintext mirrors, best effort

use crate::domain::accounts::{CredentialRecord, RegistrySnapshot, Tag, SNAPSHOT_VERSION};
use crate::infra::app_paths::{ensure_dir, VaultPaths};
use crate::infra::crypto::{self, CryptoService};
use crate::infra::settings::{write_settings_file, BackupPolicy, VaultSettings};
use crate::shared::error::{AppError, AppResult};
use crate::shared::mutex_ext::RwLockExt;
use crate::shared::security::SecretToken;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

const BACKUP_PREFIX: &str = "accounts_";
const BACKUP_SUFFIX: &str = ".json.enc";
/// Length of `%Y%m%d_%H%M%S_%3f`.
const BACKUP_STAMP_LEN: usize = 19;
const TAGS_DOCUMENT_VERSION: &str = "1.0";

/// Persistence seam used by the registry.
pub trait SnapshotStore: Send + Sync {
    fn save(&self, snapshot: &RegistrySnapshot) -> AppResult<()>;

    /// `Ok(None)` means nothing has been persisted yet.
    fn load(&self) -> AppResult<Option<RegistrySnapshot>>;

    fn set_backup_policy(&self, _policy: BackupPolicy) {}

    fn restore_from_backup(&self, name: &str) -> AppResult<RegistrySnapshot> {
        Err(unsupported(&format!("restoring backup {name}")))
    }

    fn create_backup(&self) -> AppResult<BackupInfo> {
        Err(unsupported("backups"))
    }

    fn list_backups(&self) -> AppResult<Vec<BackupInfo>> {
        Ok(Vec::new())
    }

    fn validate_integrity(&self) -> AppResult<IntegrityReport> {
        Err(unsupported("integrity checks"))
    }

    /// Writes an export of `snapshot` to `path`; returns the number of bytes written.
    fn export_to_file(
        &self,
        snapshot: &RegistrySnapshot,
        path: &Path,
        password: Option<&str>,
    ) -> AppResult<usize> {
        let bytes = encode_export(snapshot, password)?;
        write_atomic(path, &bytes)?;
        tracing::info!(
            path = %path.display(),
            accounts = snapshot.accounts.len(),
            encrypted = password.is_some(),
            "export file written"
        );
        Ok(bytes.len())
    }

    fn import_from_file(&self, path: &Path, password: Option<&str>) -> AppResult<RegistrySnapshot> {
        let bytes = std::fs::read(path).map_err(|e| {
            AppError::invalid_input(format!("failed to read {}: {e}", path.display()))
        })?;
        decode_export(&bytes, password)
    }
}

fn unsupported(what: &str) -> AppError {
    AppError::new("SYSTEM_ERROR", format!("store does not support {what}"))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRecord {
    #[serde(flatten)]
    record: CredentialRecord,
    #[serde(default, skip_serializing_if = "SecretToken::is_empty")]
    bearer_token: SecretToken,
    #[serde(default, skip_serializing_if = "SecretToken::is_empty")]
    refresh_token: SecretToken,
}

impl From<&CredentialRecord> for StoredRecord {
    fn from(record: &CredentialRecord) -> Self {
        Self {
            bearer_token: record.bearer_token.clone(),
            refresh_token: record.refresh_token.clone(),
            record: record.clone(),
        }
    }
}

impl From<StoredRecord> for CredentialRecord {
    fn from(stored: StoredRecord) -> Self {
        let StoredRecord {
            mut record,
            bearer_token,
            refresh_token,
        } = stored;
        record.bearer_token = bearer_token;
        record.refresh_token = refresh_token;
        record
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSnapshot {
    version: String,
    #[serde(default)]
    accounts: Vec<StoredRecord>,
    #[serde(default)]
    active_account_id: Option<String>,
    #[serde(default)]
    settings: VaultSettings,
    #[serde(default)]
    tags: Vec<Tag>,
    last_updated: DateTime<Utc>,
}

impl From<&RegistrySnapshot> for StoredSnapshot {
    fn from(snapshot: &RegistrySnapshot) -> Self {
        Self {
            version: snapshot.version.clone(),
            accounts: snapshot.accounts.iter().map(StoredRecord::from).collect(),
            active_account_id: snapshot.active_account_id.clone(),
            settings: snapshot.settings.clone(),
            tags: snapshot.tags.clone(),
            last_updated: snapshot.last_updated,
        }
    }
}

impl From<StoredSnapshot> for RegistrySnapshot {
    fn from(stored: StoredSnapshot) -> Self {
        Self {
            version: stored.version,
            accounts: stored.accounts.into_iter().map(Into::into).collect(),
            active_account_id: stored.active_account_id,
            settings: stored.settings,
            tags: stored.tags,
            last_updated: stored.last_updated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub data_dir: PathBuf,
    pub accounts_file_exists: bool,
    pub accounts_file_size: u64,
    pub backup_count: usize,
    pub backup_total_size: u64,
    pub latest_backup_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub account_count: usize,
    pub tag_count: usize,
    pub active_account_id: Option<String>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TagsDocument {
    version: String,
    tags: Vec<Tag>,
}

pub fn write_atomic(path: &Path, bytes: &[u8]) -> AppResult<()> {
    let file_name = path
        .file_name()
        .and_then(|v| v.to_str())
        .ok_or_else(|| AppError::persistence(format!("invalid target path {}", path.display())))?;
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

    std::fs::write(&tmp_path, bytes).map_err(|e| {
        AppError::persistence(format!("failed to write temp file {}: {e}", tmp_path.display()))
    })?;

    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(AppError::persistence(format!(
            "failed to finalize {}: {e}",
            path.display()
        )));
    }
    Ok(())
}

/// Plaintext JSON of the public snapshot shape. Tokens never appear here.
pub fn serialize_snapshot(snapshot: &RegistrySnapshot) -> AppResult<Vec<u8>> {
    serde_json::to_vec_pretty(snapshot)
        .map_err(|e| AppError::persistence(format!("failed to serialize account data: {e}")))
}

pub fn deserialize_snapshot(bytes: &[u8]) -> AppResult<RegistrySnapshot> {
    let snapshot: RegistrySnapshot = serde_json::from_slice(bytes)
        .map_err(|e| AppError::invalid_input(format!("invalid account data: {e}")))?;
    if snapshot.version.trim().is_empty() {
        return Err(AppError::invalid_input("account data is missing a version"));
    }
    Ok(snapshot)
}

pub fn encode_export(snapshot: &RegistrySnapshot, password: Option<&str>) -> AppResult<Vec<u8>> {
    let plain = serialize_snapshot(snapshot)?;
    match password {
        Some(password) => Ok(crypto::encrypt_with_password(&plain, password)?),
        None => Ok(plain),
    }
}

pub fn decode_export(bytes: &[u8], password: Option<&str>) -> AppResult<RegistrySnapshot> {
    if bytes.is_empty() {
        return Err(AppError::invalid_input("import data is empty"));
    }
    match password {
        Some(password) => {
            let plain = crypto::decrypt_with_password(bytes, password)?;
            deserialize_snapshot(&plain)
        }
        None => deserialize_snapshot(bytes).map_err(|err| {
            if serde_json::from_slice::<serde_json::Value>(bytes).is_err() {
                AppError::invalid_input(
                    "import data is not plaintext JSON; a password is required",
                )
            } else {
                err
            }
        }),
    }
}

fn is_backup_file_name(name: &str) -> bool {
    name.starts_with(BACKUP_PREFIX)
        && name.ends_with(BACKUP_SUFFIX)
        && name.len() > BACKUP_PREFIX.len() + BACKUP_SUFFIX.len()
        && !name.contains(['/', '\\'])
        && !name.contains("..")
}

/// `(timestamp, collision counter)` so `_10` orders after `_2` within one millisecond.
fn backup_sort_key(name: &str) -> (&str, u32) {
    let core = name
        .strip_prefix(BACKUP_PREFIX)
        .and_then(|n| n.strip_suffix(BACKUP_SUFFIX))
        .unwrap_or(name);
    if core.len() > BACKUP_STAMP_LEN && core.is_char_boundary(BACKUP_STAMP_LEN) {
        let (stamp, tail) = core.split_at(BACKUP_STAMP_LEN);
        if let Some(counter) = tail.strip_prefix('_').and_then(|c| c.parse::<u32>().ok()) {
            return (stamp, counter);
        }
    }
    (core, 0)
}

fn modified_at(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_default()
}

pub struct EncryptedStore {
    paths: VaultPaths,
    crypto: Arc<CryptoService>,
    policy: RwLock<BackupPolicy>,
}

impl EncryptedStore {
    pub fn new(paths: VaultPaths, crypto: Arc<CryptoService>) -> AppResult<Self> {
        ensure_dir(&paths.data_dir)?;
        Ok(Self {
            paths,
            crypto,
            policy: RwLock::new(BackupPolicy::default()),
        })
    }

    pub fn paths(&self) -> &VaultPaths {
        &self.paths
    }

    pub fn backup_policy(&self) -> BackupPolicy {
        *self.policy.read_or_recover()
    }

    fn encrypt_snapshot(&self, snapshot: &RegistrySnapshot) -> AppResult<Vec<u8>> {
        let stored = StoredSnapshot::from(snapshot);
        let plain = zeroize::Zeroizing::new(serde_json::to_vec(&stored).map_err(|e| {
            AppError::persistence(format!("failed to serialize registry snapshot: {e}"))
        })?);
        Ok(self.crypto.encrypt(&plain)?)
    }

    fn decrypt_snapshot(&self, ciphertext: &[u8]) -> AppResult<RegistrySnapshot> {
        let plain = zeroize::Zeroizing::new(self.crypto.decrypt(ciphertext)?);
        let stored: StoredSnapshot = serde_json::from_slice(&plain).map_err(|e| {
            AppError::persistence(format!("decrypted registry snapshot is not valid json: {e}"))
        })?;
        Ok(stored.into())
    }

    fn write_backup_bytes(&self, ciphertext: &[u8]) -> AppResult<BackupInfo> {
        let dir = self.paths.backups_dir();
        ensure_dir(&dir)?;

        let stamp = Utc::now().format("%Y%m%d_%H%M%S_%3f").to_string();
        let mut name = format!("{BACKUP_PREFIX}{stamp}{BACKUP_SUFFIX}");
        let mut suffix = 1;
        while dir.join(&name).exists() {
            name = format!("{BACKUP_PREFIX}{stamp}_{suffix}{BACKUP_SUFFIX}");
            suffix += 1;
        }

        let path = dir.join(&name);
        write_atomic(&path, ciphertext)?;
        let meta = std::fs::metadata(&path)?;
        Ok(BackupInfo {
            name,
            path,
            size: meta.len(),
            modified_at: modified_at(&meta),
        })
    }

    fn prune_backups(&self, policy: BackupPolicy) -> AppResult<usize> {
        let backups = self.list_backups()?;
        let cutoff = (policy.retention_days > 0)
            .then(|| Utc::now() - chrono::Duration::days(i64::from(policy.retention_days)));

        let mut removed = 0;
        for (index, backup) in backups.iter().enumerate() {
            let over_count = index >= policy.max_backups;
            // The newest backup always survives the age rule.
            let too_old = index > 0 && cutoff.is_some_and(|c| backup.modified_at < c);
            if !over_count && !too_old {
                continue;
            }
            match std::fs::remove_file(&backup.path) {
                Ok(()) => removed += 1,
                Err(err) => tracing::warn!(
                    backup = %backup.name,
                    "failed to prune backup: {err}"
                ),
            }
        }
        Ok(removed)
    }

    fn write_mirrors(&self, snapshot: &RegistrySnapshot) {
        if let Err(err) = write_settings_file(&self.paths.settings_file(), &snapshot.settings) {
            tracing::warn!("failed to mirror settings.json: {err}");
        }
        if let Err(err) = self.write_tags_file(&snapshot.tags) {
            tracing::warn!("failed to mirror tags.json: {err}");
        }
    }

    pub fn write_tags_file(&self, tags: &[Tag]) -> AppResult<()> {
        let doc = TagsDocument {
            version: TAGS_DOCUMENT_VERSION.to_string(),
            tags: tags.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)
            .map_err(|e| AppError::persistence(format!("failed to serialize tags: {e}")))?;
        write_atomic(&self.paths.tags_file(), &bytes)
    }

    pub fn read_tags_file(&self) -> AppResult<Option<Vec<Tag>>> {
        let path = self.paths.tags_file();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let doc: TagsDocument = serde_json::from_slice(&bytes)
            .map_err(|e| AppError::persistence(format!("invalid tags.json: {e}")))?;
        Ok(Some(doc.tags))
    }

    /// Copies the current primary ciphertext into the backup directory.
    pub fn create_backup(&self) -> AppResult<BackupInfo> {
        let primary = self.paths.accounts_file();
        let ciphertext = match std::fs::read(&primary) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::not_found("no account data to back up yet"))
            }
            Err(err) => return Err(err.into()),
        };
        let info = self.write_backup_bytes(&ciphertext)?;
        let policy = self.backup_policy();
        if let Err(err) = self.prune_backups(policy) {
            tracing::warn!("failed to prune backups: {err}");
        }
        Ok(info)
    }

    /// Newest first.
    pub fn list_backups(&self) -> AppResult<Vec<BackupInfo>> {
        let dir = self.paths.backups_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut backups = Vec::new();
        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !is_backup_file_name(&name) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            backups.push(BackupInfo {
                path: entry.path(),
                size: meta.len(),
                modified_at: modified_at(&meta),
                name,
            });
        }
        backups.sort_by(|a, b| {
            b.modified_at
                .cmp(&a.modified_at)
                .then_with(|| backup_sort_key(&b.name).cmp(&backup_sort_key(&a.name)))
        });
        Ok(backups)
    }

    pub fn validate_integrity(&self) -> AppResult<IntegrityReport> {
        let snapshot = self
            .load_snapshot()?
            .ok_or_else(|| AppError::not_found("no account data has been saved yet"))?;

        let mut active = snapshot.accounts.iter().filter(|a| a.is_active);
        let active_record = active.next();
        if active.next().is_some() {
            return Err(AppError::persistence("snapshot has more than one active account"));
        }
        if !snapshot.accounts.is_empty() && active_record.is_none() {
            return Err(AppError::persistence("snapshot has accounts but no active account"));
        }

        Ok(IntegrityReport {
            account_count: snapshot.accounts.len(),
            tag_count: snapshot.tags.len(),
            active_account_id: snapshot.active_account_id,
            last_updated: snapshot.last_updated,
        })
    }

    pub fn storage_stats(&self) -> AppResult<StorageStats> {
        let primary = std::fs::metadata(self.paths.accounts_file()).ok();
        let backups = self.list_backups()?;
        Ok(StorageStats {
            data_dir: self.paths.data_dir.clone(),
            accounts_file_exists: primary.is_some(),
            accounts_file_size: primary.map(|m| m.len()).unwrap_or(0),
            backup_count: backups.len(),
            backup_total_size: backups.iter().map(|b| b.size).sum(),
            latest_backup_at: backups.first().map(|b| b.modified_at),
        })
    }

    fn load_snapshot(&self) -> AppResult<Option<RegistrySnapshot>> {
        let path = self.paths.accounts_file();
        let ciphertext = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(AppError::persistence(format!(
                    "failed to read {}: {err}",
                    path.display()
                )))
            }
        };
        self.decrypt_snapshot(&ciphertext).map(Some)
    }
}

impl SnapshotStore for EncryptedStore {
    fn save(&self, snapshot: &RegistrySnapshot) -> AppResult<()> {
        let ciphertext = self.encrypt_snapshot(snapshot)?;
        write_atomic(&self.paths.accounts_file(), &ciphertext)?;

        let policy = self.backup_policy();
        if policy.enabled {
            match self.write_backup_bytes(&ciphertext) {
                Ok(info) => tracing::debug!(backup = %info.name, "wrote registry backup"),
                Err(err) => tracing::warn!("registry backup failed: {err}"),
            }
            if let Err(err) = self.prune_backups(policy) {
                tracing::warn!("failed to prune backups: {err}");
            }
        }

        self.write_mirrors(snapshot);
        tracing::debug!(
            accounts = snapshot.accounts.len(),
            tags = snapshot.tags.len(),
            "registry snapshot saved"
        );
        Ok(())
    }

    fn load(&self) -> AppResult<Option<RegistrySnapshot>> {
        let loaded = self.load_snapshot()?;
        if let Some(snapshot) = &loaded {
            if snapshot.version != SNAPSHOT_VERSION {
                tracing::warn!(
                    version = %snapshot.version,
                    "registry snapshot has an unexpected schema version"
                );
            }
        }
        Ok(loaded)
    }

    fn set_backup_policy(&self, policy: BackupPolicy) {
        *self.policy.write_or_recover() = policy;
    }

    fn create_backup(&self) -> AppResult<BackupInfo> {
        EncryptedStore::create_backup(self)
    }

    fn list_backups(&self) -> AppResult<Vec<BackupInfo>> {
        EncryptedStore::list_backups(self)
    }

    fn validate_integrity(&self) -> AppResult<IntegrityReport> {
        EncryptedStore::validate_integrity(self)
    }

    fn restore_from_backup(&self, name: &str) -> AppResult<RegistrySnapshot> {
        let name = name.trim();
        if !is_backup_file_name(name) {
            return Err(AppError::invalid_input(format!("invalid backup name: {name}")));
        }
        let path = self.paths.backups_dir().join(name);
        let ciphertext = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::not_found(format!("backup {name} not found")))
            }
            Err(err) => return Err(err.into()),
        };

        // Validate before touching the primary file.
        let snapshot = self.decrypt_snapshot(&ciphertext)?;
        write_atomic(&self.paths.accounts_file(), &ciphertext)?;
        self.write_mirrors(&snapshot);
        tracing::info!(backup = %name, accounts = snapshot.accounts.len(), "restored registry from backup");
        Ok(snapshot)
    }
}
