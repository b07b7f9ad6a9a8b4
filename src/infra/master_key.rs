//! Usage: Load the device master key from `$KIRO_VAULT_MASTER_KEY` or a generated `master.key` file.

use crate::shared::error::{AppError, AppResult};
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::Path;
use zeroize::Zeroizing;

pub const ENV_MASTER_KEY: &str = "KIRO_VAULT_MASTER_KEY";
const GENERATED_KEY_BYTES: usize = 32;

pub fn load_or_create_master_key(key_file: &Path) -> AppResult<Zeroizing<String>> {
    if let Some(from_env) = std::env::var(ENV_MASTER_KEY)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
    {
        tracing::debug!("master key taken from environment");
        return Ok(Zeroizing::new(from_env));
    }

    match std::fs::read_to_string(key_file) {
        Ok(content) => {
            let key = content.trim().to_string();
            if key.is_empty() {
                return Err(AppError::persistence(format!(
                    "master key file {} is empty",
                    key_file.display()
                )));
            }
            return Ok(Zeroizing::new(key));
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(AppError::persistence(format!(
                "failed to read master key {}: {err}",
                key_file.display()
            )))
        }
    }

    let mut raw = Zeroizing::new([0u8; GENERATED_KEY_BYTES]);
    OsRng.fill_bytes(&mut raw[..]);
    let key = Zeroizing::new(hex::encode(&raw[..]));

    crate::infra::store::write_atomic(key_file, key.as_bytes())?;
    restrict_permissions(key_file);
    tracing::info!(path = %key_file.display(), "generated new vault master key");
    Ok(key)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(err) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        tracing::warn!(path = %path.display(), "failed to restrict master key permissions: {err}");
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}
