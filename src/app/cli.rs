//! Usage: `kiro-vault` command line (clap derive). Every command prints pretty JSON on stdout.

use crate::app::app_state::AppServices;
use crate::app::logging;
use crate::domain::accounts::{CredentialRecord, OAuthProvider, Tag};
use crate::domain::registry::{AccountUpdate, TagPatch};
use crate::gateway::account_switch::switch_with_refresh;
use crate::gateway::oauth::backend::BackendKind;
use crate::gateway::oauth::browser::open_browser;
use crate::gateway::oauth::callback_server::LoginOutcome;
use crate::infra::api_config::ApiConfig;
use crate::infra::app_paths::{resolve_data_dir, VaultPaths};
use crate::infra::settings::VaultSettings;
use crate::shared::blocking;
use crate::shared::error::{AppError, AppResult};
use crate::shared::security::SecretToken;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "kiro-vault")]
#[command(about = "Encrypted multi-account vault for Kiro credentials")]
#[command(version)]
pub struct Cli {
    /// Data directory (default: $KIRO_VAULT_HOME or ~/.kiro-vault).
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Debug-level logging unless RUST_LOG is set.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List accounts (tokens are never printed).
    List {
        #[arg(long)]
        tag: Option<String>,
    },
    Show {
        id: String,
    },
    /// Add an account from a pasted bearer token, optionally with its refresh token.
    AddToken {
        #[arg(long, env = "KIRO_BEARER_TOKEN", hide_env_values = true)]
        bearer: String,
        #[arg(long, env = "KIRO_REFRESH_TOKEN", hide_env_values = true)]
        refresh: Option<String>,
    },
    /// Remove one account, or several in one batch.
    Remove {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    Switch {
        id: String,
    },
    /// Apply a partial update, e.g. `--json '{"notes":"work"}'`.
    Update {
        id: String,
        #[arg(long)]
        json: String,
    },
    Tags {
        #[command(subcommand)]
        action: TagAction,
    },
    /// Add tags to many accounts at once.
    BatchTag {
        #[arg(long = "id", required = true)]
        ids: Vec<String>,
        #[arg(long = "tag", required = true)]
        tags: Vec<String>,
    },
    /// Refresh tokens for the given accounts (all accounts when none are given).
    BatchRefresh {
        ids: Vec<String>,
    },
    /// Check a stored bearer token against the auth service.
    Validate {
        id: String,
    },
    Export {
        path: PathBuf,
        #[arg(long, env = "KIRO_VAULT_EXPORT_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    Import {
        path: PathBuf,
        #[arg(long, env = "KIRO_VAULT_EXPORT_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },
    /// Integrity check of the primary store plus storage usage.
    Verify,
    Stats,
    /// Buckets at or above the alert threshold (default: from settings).
    Alerts {
        #[arg(long)]
        threshold: Option<f64>,
    },
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Browser login through the loopback callback.
    Login {
        /// Defaults to `preferredOAuthProvider` from settings.
        #[arg(long)]
        provider: Option<String>,
        #[arg(long, default_value = "desktop")]
        backend: String,
        /// Print the URL instead of launching a browser.
        #[arg(long)]
        no_browser: bool,
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },
    /// Show (and store) the quota of one account.
    Quota {
        id: String,
        /// Bypass the in-memory cache.
        #[arg(long)]
        refresh: bool,
    },
    /// Poll quotas periodically and print alerts until Ctrl-C.
    Monitor {
        #[arg(long)]
        interval_secs: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
pub enum TagAction {
    List,
    Create {
        name: String,
        #[arg(long)]
        color: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Rename or recolor, e.g. `--json '{"name":"team-b"}'`.
    Update {
        name: String,
        #[arg(long)]
        json: String,
    },
    Delete {
        name: String,
    },
    Add {
        id: String,
        #[arg(required = true)]
        tags: Vec<String>,
    },
    Remove {
        id: String,
        #[arg(required = true)]
        tags: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum BackupAction {
    Create,
    List,
    Restore { name: String },
}

#[derive(Subcommand, Debug)]
pub enum SettingsAction {
    Show,
    /// Merge a partial JSON object into the current settings.
    Set {
        #[arg(long)]
        json: String,
    },
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> AppResult<()> {
    let text = serde_json::to_string_pretty(value)?;
    let mut out = std::io::stdout().lock();
    writeln!(out, "{text}")?;
    Ok(())
}

fn parse_json<T: serde::de::DeserializeOwned>(what: &str, raw: &str) -> AppResult<T> {
    serde_json::from_str(raw).map_err(|e| AppError::invalid_input(format!("invalid {what} json: {e}")))
}

/// Overlays the keys of `patch` onto `current`; unknown keys are rejected.
pub fn merge_settings(current: &VaultSettings, patch: &str) -> AppResult<VaultSettings> {
    let patch: serde_json::Value = parse_json("settings", patch)?;
    let serde_json::Value::Object(patch) = patch else {
        return Err(AppError::invalid_input("settings patch must be a json object"));
    };
    let mut merged = serde_json::to_value(current)?;
    let Some(target) = merged.as_object_mut() else {
        return Err(AppError::new("SYSTEM_ERROR", "settings did not serialize to an object"));
    };
    for (key, value) in patch {
        if !target.contains_key(&key) {
            return Err(AppError::invalid_input(format!("unknown setting: {key}")));
        }
        target.insert(key, value);
    }
    parse_json("settings", &merged.to_string())
}

/// `--provider` when given, otherwise the preferred provider from settings.
pub fn login_provider(arg: Option<&str>, settings: &VaultSettings) -> AppResult<OAuthProvider> {
    match arg {
        Some(raw) => OAuthProvider::parse(raw)
            .ok_or_else(|| AppError::invalid_input(format!("unknown provider: {raw}"))),
        None => Ok(settings.preferred_oauth_provider),
    }
}

fn require_bearer(record: &CredentialRecord) -> AppResult<&SecretToken> {
    if record.bearer_token.is_empty() {
        return Err(AppError::invalid_input(format!(
            "account {} has no bearer token",
            record.id
        )));
    }
    Ok(&record.bearer_token)
}

/// Parses args, sets up logging and services, and runs one command.
pub async fn run(cli: Cli) -> AppResult<()> {
    let data_dir = resolve_data_dir(cli.data_dir.as_deref())?;
    logging::init(&VaultPaths::new(&data_dir).logs_dir(), cli.verbose);
    let config = ApiConfig::from_env()?;
    let services = AppServices::build(data_dir, config)?;

    let result = dispatch(&services, cli.command).await;
    services.shutdown().await;
    if let Err(err) = &result {
        tracing::debug!(code = err.code(), "command failed");
    }
    result
}

async fn dispatch(services: &AppServices, command: Command) -> AppResult<()> {
    let registry = &services.registry;
    match command {
        Command::List { tag } => match tag {
            Some(tag) => print_json(&registry.accounts_by_tag(&tag)),
            None => print_json(&registry.list_accounts()),
        },
        Command::Show { id } => print_json(&registry.get_account(&id)?),
        Command::AddToken { bearer, refresh } => {
            let record = services
                .token_client
                .create_account_from_token(&bearer, refresh.as_deref())
                .await?;
            let registry = Arc::clone(registry);
            let stored = blocking::run("cli.add_token", move || registry.add_account(record)).await?;
            print_json(&stored)
        }
        Command::Remove { ids } => {
            if let [id] = ids.as_slice() {
                print_json(&registry.remove_account(id)?)
            } else {
                print_json(&registry.batch_delete_accounts(&ids)?)
            }
        }
        Command::Switch { id } => {
            let switched = switch_with_refresh(
                registry,
                &id,
                services.token_client.as_ref(),
                services.usage_client.as_ref(),
            )
            .await?;
            print_json(&switched)
        }
        Command::Update { id, json } => {
            let update: AccountUpdate = parse_json("account update", &json)?;
            print_json(&registry.update_account(&id, update)?)
        }
        Command::Tags { action } => run_tag_action(services, action),
        Command::BatchTag { ids, tags } => print_json(&registry.batch_add_tags(&ids, &tags)?),
        Command::BatchRefresh { ids } => {
            let ids = if ids.is_empty() {
                registry.list_accounts().into_iter().map(|a| a.id).collect()
            } else {
                ids
            };
            let result = registry
                .batch_refresh_tokens(&ids, services.token_client.clone())
                .await?;
            print_json(&result)
        }
        Command::Validate { id } => {
            let record = registry.get_account(&id)?;
            let valid = services
                .token_client
                .validate(require_bearer(&record)?.expose())
                .await?;
            print_json(&serde_json::json!({ "id": record.id, "valid": valid }))
        }
        Command::Export { path, password } => {
            let bytes = registry.export_to_file(&path, password.as_deref())?;
            print_json(&serde_json::json!({
                "path": path.display().to_string(),
                "encrypted": password.is_some(),
                "accounts": registry.account_count(),
                "bytes": bytes,
            }))
        }
        Command::Import { path, password } => {
            print_json(&registry.import_from_file(&path, password.as_deref())?)
        }
        Command::Backup { action } => match action {
            BackupAction::Create => print_json(&registry.create_backup()?),
            BackupAction::List => print_json(&registry.list_backups()?),
            BackupAction::Restore { name } => {
                let snapshot = registry.restore_from_backup(&name)?;
                print_json(&serde_json::json!({
                    "restored": name,
                    "accounts": snapshot.accounts.len(),
                }))
            }
        },
        Command::Verify => print_json(&serde_json::json!({
            "integrity": registry.validate_integrity()?,
            "storage": services.store.storage_stats()?,
        })),
        Command::Stats => print_json(&registry.account_stats()),
        Command::Alerts { threshold } => {
            let threshold = threshold.unwrap_or_else(|| registry.settings().quota_alert_threshold);
            print_json(&registry.quota_alerts(threshold))
        }
        Command::Settings { action } => match action {
            SettingsAction::Show => print_json(&registry.settings()),
            SettingsAction::Set { json } => {
                let merged = merge_settings(&registry.settings(), &json)?;
                print_json(&registry.update_settings(merged)?)
            }
        },
        Command::Login {
            provider,
            backend,
            no_browser,
            timeout_secs,
        } => {
            let provider = login_provider(provider.as_deref(), &registry.settings())?;
            let backend = BackendKind::parse(&backend)
                .ok_or_else(|| AppError::invalid_input(format!("unknown login backend: {backend}")))?;
            let outcome =
                run_login(services, provider, backend, no_browser, Duration::from_secs(timeout_secs))
                    .await?;
            match outcome.error {
                Some(error) => Err(error.into()),
                None => print_json(&outcome),
            }
        }
        Command::Quota { id, refresh } => {
            let record = registry.get_account(&id)?;
            let token = require_bearer(&record)?.expose();
            let snapshot = if refresh {
                services
                    .quota_cache
                    .refresh_quota(&record.id, token, record.profile_arn.as_deref())
                    .await?
            } else {
                services.quota_cache.get_quota(token).await?
            };
            let registry = Arc::clone(registry);
            let updated = blocking::run("cli.apply_quota", move || {
                registry.apply_quota(&record.id, snapshot.quota, Some(snapshot.subscription))
            })
            .await?;
            print_json(&updated)
        }
        Command::Monitor { interval_secs } => run_monitor(services, interval_secs).await,
    }
}

fn run_tag_action(services: &AppServices, action: TagAction) -> AppResult<()> {
    let registry = &services.registry;
    match action {
        TagAction::List => print_json(&registry.list_tags()),
        TagAction::Create {
            name,
            color,
            description,
        } => {
            let mut tag = Tag::new(name);
            if let Some(color) = color {
                tag.color = color;
            }
            tag.description = description;
            print_json(&registry.create_tag(tag)?)
        }
        TagAction::Update { name, json } => {
            let patch: TagPatch = parse_json("tag patch", &json)?;
            print_json(&registry.update_tag(&name, patch)?)
        }
        TagAction::Delete { name } => {
            let affected = registry.delete_tag(&name)?;
            print_json(&serde_json::json!({ "deleted": name, "accountsUpdated": affected }))
        }
        TagAction::Add { id, tags } => print_json(&registry.add_tags_to_account(&id, &tags)?),
        TagAction::Remove { id, tags } => {
            print_json(&registry.remove_tags_from_account(&id, &tags)?)
        }
    }
}

async fn run_login(
    services: &AppServices,
    provider: OAuthProvider,
    backend: BackendKind,
    no_browser: bool,
    timeout: Duration,
) -> AppResult<LoginOutcome> {
    services.callback_server.start().await?;
    let mut outcomes = services.callback_server.subscribe();
    let start = services.coordinator.start_flow(provider, backend).await?;

    eprintln!("Open this URL to sign in:\n{}", start.auth_url);
    if !no_browser {
        if let Err(err) = open_browser(&start.auth_url) {
            tracing::warn!("could not launch a browser: {err}");
        }
    }

    let wait = async {
        loop {
            match outcomes.recv().await {
                Ok(outcome) if outcome.state == start.state => return Ok(outcome),
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "login outcome receiver lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return Err(AppError::new("SYSTEM_ERROR", "login callback server closed"));
                }
            }
        }
    };
    let result = match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => {
            services.coordinator.fail_flow(&start.state);
            Err(AppError::new("SYSTEM_ERROR", "timed out waiting for the login callback"))
        }
    };
    services.callback_server.stop().await;
    result
}

async fn run_monitor(services: &AppServices, interval_secs: Option<u64>) -> AppResult<()> {
    let mut alerts = services.monitor.subscribe();
    let started = match interval_secs {
        Some(secs) => services.monitor.start(Duration::from_secs(secs)),
        None if !services.registry.settings().auto_refresh_quota => {
            return Err(AppError::invalid_input(
                "autoRefreshQuota is disabled; pass --interval-secs to poll anyway",
            ));
        }
        None => services.monitor.start_from_settings(),
    };
    if !started {
        return Err(AppError::conflict("quota monitor is already running"));
    }

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    tracing::warn!("ctrl-c handler failed: {err}");
                }
                break;
            }
            received = alerts.recv() => match received {
                Ok(batch) => print_json(&batch)?,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "quota alerts dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    services.monitor.stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_nested_subcommands_and_globals() {
        let cli = Cli::try_parse_from([
            "kiro-vault",
            "--data-dir",
            "/tmp/vault",
            "tags",
            "add",
            "kiro-1",
            "work",
            "team",
        ])
        .expect("parse");
        assert_eq!(cli.data_dir.as_deref(), Some(std::path::Path::new("/tmp/vault")));
        match cli.command {
            Command::Tags {
                action: TagAction::Add { id, tags },
            } => {
                assert_eq!(id, "kiro-1");
                assert_eq!(tags, vec!["work".to_string(), "team".to_string()]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn login_provider_falls_back_to_preferred_setting() {
        let settings = VaultSettings {
            preferred_oauth_provider: OAuthProvider::Github,
            ..VaultSettings::default()
        };
        assert_eq!(login_provider(None, &settings).expect("default"), OAuthProvider::Github);
        assert_eq!(
            login_provider(Some("google"), &settings).expect("explicit"),
            OAuthProvider::Google
        );
        assert!(login_provider(Some("myspace"), &settings).is_err());

        let cli = Cli::try_parse_from(["kiro-vault", "login", "--no-browser"]).expect("parse");
        match cli.command {
            Command::Login { provider, .. } => assert!(provider.is_none()),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn merge_settings_rejects_retired_display_keys() {
        let err = merge_settings(&VaultSettings::default(), r#"{"showQuotaInStatusBar":false}"#)
            .expect_err("unknown key");
        assert_eq!(err.code(), "SEC_INVALID_INPUT");
    }

    #[test]
    fn merge_settings_overlays_known_keys_only() {
        let current = VaultSettings::default();
        let merged = merge_settings(&current, r#"{"maxBackups":3,"autoBackup":false}"#).expect("merge");
        assert_eq!(merged.max_backups, 3);
        assert!(!merged.auto_backup);
        assert_eq!(merged.quota_refresh_interval, current.quota_refresh_interval);

        let err = merge_settings(&current, r#"{"noSuchKey":1}"#).expect_err("unknown");
        assert_eq!(err.code(), "SEC_INVALID_INPUT");
        assert!(merge_settings(&current, "[1]").is_err());
    }
}
