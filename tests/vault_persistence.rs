mod support;

use kiro_vault::domain::accounts::{CredentialRecord, LoginMethod, OAuthProvider};
use kiro_vault::domain::registry::AccountUpdate;
use kiro_vault::infra::app_paths::VaultPaths;
use kiro_vault::infra::crypto::CryptoService;
use kiro_vault::infra::settings::VaultSettings;
use kiro_vault::infra::store::{EncryptedStore, SnapshotStore};
use std::sync::Arc;
use support::TestVault;

fn oauth_record(email: &str, bearer: &str) -> CredentialRecord {
    let mut record =
        CredentialRecord::new(email, LoginMethod::Oauth).with_tokens(bearer, format!("refresh-{email}"));
    record.provider = Some(OAuthProvider::Github);
    record
}

#[test]
fn accounts_and_tokens_survive_reopen_and_never_hit_disk_in_plaintext() {
    let vault = TestVault::new();
    let services = vault.offline_services();

    let alice = services
        .registry
        .add_account(oauth_record("alice@example.com", "alice-bearer-secret-0001"))
        .expect("alice");
    let bob = services
        .registry
        .add_account(oauth_record("bob@example.com", "bob-bearer-secret-0002"))
        .expect("bob");
    services.registry.switch_account(&bob.id).expect("switch");
    drop(services);

    let raw = std::fs::read(VaultPaths::new(vault.data_dir()).accounts_file()).expect("primary file");
    let haystack = String::from_utf8_lossy(&raw);
    assert!(!haystack.contains("alice@example.com"));
    assert!(!haystack.contains("bearer-secret"));
    assert!(VaultPaths::new(vault.data_dir()).master_key_file().exists());

    let reopened = vault.offline_services();
    let accounts = reopened.registry.list_accounts();
    assert_eq!(accounts.len(), 2);
    let active = reopened.registry.get_active_account().expect("active");
    assert_eq!(active.id, bob.id);
    assert_eq!(accounts.iter().filter(|a| a.is_active).count(), 1);

    let alice_again = reopened.registry.get_account(&alice.id).expect("alice");
    assert_eq!(alice_again.bearer_token.expose(), "alice-bearer-secret-0001");
    assert_eq!(alice_again.provider, Some(OAuthProvider::Github));
}

#[test]
fn wrong_master_key_cannot_open_the_store() {
    let vault = TestVault::new();
    let services = vault.offline_services();
    services
        .registry
        .add_account(oauth_record("alice@example.com", "alice-bearer-secret-0001"))
        .expect("alice");
    drop(services);

    let other = EncryptedStore::new(
        VaultPaths::new(vault.data_dir()),
        Arc::new(CryptoService::new("a completely different key").expect("crypto")),
    )
    .expect("store");
    let err = other.load().expect_err("wrong key");
    assert_eq!(err.code(), "DECRYPTION_FAILED");
}

#[test]
fn settings_and_tags_are_mirrored_as_plaintext_json() {
    let vault = TestVault::new();
    let services = vault.offline_services();
    let alice = services
        .registry
        .add_account(oauth_record("alice@example.com", "alice-bearer-secret-0001"))
        .expect("alice");
    services
        .registry
        .add_tags_to_account(&alice.id, &["work".to_string()])
        .expect("tag");

    let mut settings = services.registry.settings();
    settings.max_backups = 2;
    services.registry.update_settings(settings).expect("settings");

    let tags: serde_json::Value =
        serde_json::from_slice(&std::fs::read(vault.path("tags.json")).expect("tags.json"))
            .expect("tags json");
    assert_eq!(tags["version"], "1.0");
    assert_eq!(tags["tags"][0]["name"], "work");

    let settings: serde_json::Value =
        serde_json::from_slice(&std::fs::read(vault.path("settings.json")).expect("settings.json"))
            .expect("settings json");
    assert_eq!(settings["maxBackups"], 2);
}

#[test]
fn backups_rotate_and_restore_reloads_registry() {
    let vault = TestVault::new();
    let services = vault.offline_services();
    let registry = &services.registry;

    let mut settings = registry.settings();
    settings.max_backups = 3;
    registry.update_settings(settings).expect("settings");

    let alice = registry
        .add_account(oauth_record("alice@example.com", "alice-bearer-secret-0001"))
        .expect("alice");
    let checkpoint = registry.create_backup().expect("manual backup");

    for i in 0..4 {
        registry
            .update_account(
                &alice.id,
                AccountUpdate {
                    notes: Some(format!("edit {i}")),
                    ..AccountUpdate::default()
                },
            )
            .expect("update");
    }
    let backups = registry.list_backups().expect("list");
    assert!(backups.len() <= 3, "pruned to max_backups, got {}", backups.len());

    let before_delete = registry.create_backup().expect("backup");
    assert_ne!(before_delete.name, checkpoint.name);
    registry
        .add_account(oauth_record("bob@example.com", "bob-bearer-secret-0002"))
        .expect("bob");
    assert_eq!(registry.account_count(), 2);

    registry
        .restore_from_backup(&before_delete.name)
        .expect("restore");
    assert_eq!(registry.account_count(), 1);
    assert_eq!(
        registry.get_account(&alice.id).expect("alice").notes,
        "edit 3"
    );

    let report = registry.validate_integrity().expect("integrity");
    assert_eq!(report.account_count, 1);
    assert_eq!(report.active_account_id.as_deref(), Some(alice.id.as_str()));

    let err = registry
        .restore_from_backup("../accounts.json.enc")
        .expect_err("traversal");
    assert_eq!(err.code(), "SEC_INVALID_INPUT");
}

#[test]
fn export_import_round_trip_with_and_without_password() {
    let vault = TestVault::new();
    let services = vault.offline_services();
    let alice = services
        .registry
        .add_account(oauth_record("alice@example.com", "alice-bearer-secret-0001"))
        .expect("alice");
    services
        .registry
        .add_tags_to_account(&alice.id, &["vip".to_string()])
        .expect("tag");

    let exports = tempfile::tempdir().expect("tempdir");
    let plain_path = exports.path().join("plain.json");
    let sealed_path = exports.path().join("sealed.bin");

    let err = services
        .registry
        .export_to_file(&plain_path, None)
        .expect_err("encryption is on by default");
    assert_eq!(err.code(), "SEC_INVALID_INPUT");
    services
        .registry
        .export_to_file(&sealed_path, Some("hunter2"))
        .expect("sealed export");
    let sealed = std::fs::read(&sealed_path).expect("sealed file");
    assert!(!String::from_utf8_lossy(&sealed).contains("alice@example.com"));

    services
        .registry
        .update_settings(VaultSettings {
            export_encryption: false,
            ..services.registry.settings()
        })
        .expect("allow plaintext export");
    services
        .registry
        .export_to_file(&plain_path, None)
        .expect("plain export");
    let plain_text = std::fs::read_to_string(&plain_path).expect("utf8 export");
    assert!(plain_text.contains("alice@example.com"));
    assert!(!plain_text.contains("bearer-secret"));
    drop(services);

    let other_dir = tempfile::tempdir().expect("tempdir");
    let target = vault.offline_services_at(other_dir.path());
    let err = target
        .registry
        .import_accounts(&sealed, Some("wrong"))
        .expect_err("wrong password");
    assert_eq!(err.code(), "DECRYPTION_FAILED");
    assert!(target.registry.import_accounts(&sealed, None).is_err());

    let report = target
        .registry
        .import_from_file(&sealed_path, Some("hunter2"))
        .expect("import");
    assert_eq!(report.imported_ids.len(), 1);
    let imported = target.registry.get_account(&report.imported_ids[0]).expect("imported");
    assert_eq!(imported.email, "alice@example.com");
    assert_ne!(imported.id, alice.id);
    assert!(imported.is_active, "first import into an empty vault becomes active");
    assert!(imported.bearer_token.is_empty());
    assert!(target.registry.list_tags().iter().any(|t| t.name == "vip"));

    let again = target
        .registry
        .import_from_file(&plain_path, None)
        .expect("second import");
    assert!(again.imported_ids.is_empty());
    assert_eq!(again.skipped.len(), 1);
    assert_eq!(target.registry.account_count(), 1);
}
