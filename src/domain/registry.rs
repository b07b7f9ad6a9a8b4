//! Usage: In-memory credential registry (single active account, tags, batch ops) backed by a `SnapshotStore`.
//!
//! Every mutation goes through [`CredentialRegistry::mutate`]: the state is cloned, the change applied,
//! the snapshot persisted, and on any failure the clone is put back.

use crate::domain::accounts::{
    generate_account_id, normalize_email, BatchResult, CredentialRecord, QuotaBucket, QuotaInfo,
    RegistrySnapshot, SubscriptionType, Tag,
};
use crate::domain::integration::{propagate_switch, SystemIntegration};
use crate::infra::settings::VaultSettings;
use crate::infra::store::{self, BackupInfo, IntegrityReport, SnapshotStore};
use crate::shared::blocking;
use crate::shared::error::{AppError, AppResult};
use crate::shared::mutex_ext::RwLockExt;
use crate::shared::security::SecretToken;
use crate::shared::time::{now_utc, strictly_after};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

/// Typed partial update. Unknown keys are rejected when parsed from JSON.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AccountUpdate {
    pub display_name: Option<String>,
    pub avatar: Option<String>,
    pub tags: Option<Vec<String>>,
    pub notes: Option<String>,
    pub bearer_token: Option<SecretToken>,
    pub refresh_token: Option<SecretToken>,
    pub token_expiry: Option<DateTime<Utc>>,
    pub quota: Option<QuotaInfo>,
    pub subscription_type: Option<SubscriptionType>,
}

impl AccountUpdate {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TagPatch {
    pub name: Option<String>,
    pub color: Option<String>,
    pub description: Option<String>,
}

/// Result of a token refresh, applied to one record.
#[derive(Debug, Clone, Default)]
pub struct RefreshedTokens {
    pub bearer_token: SecretToken,
    /// Present when the provider rotated the refresh token.
    pub refresh_token: Option<SecretToken>,
    pub token_expiry: Option<DateTime<Utc>>,
    pub profile_arn: Option<String>,
}

pub type RefreshFuture<'a> = Pin<Box<dyn Future<Output = AppResult<RefreshedTokens>> + Send + 'a>>;

/// Network side of `batch_refresh_tokens`; implemented by the token client.
pub trait TokenRefresher: Send + Sync {
    fn refresh_tokens<'a>(&'a self, refresh_token: &'a str) -> RefreshFuture<'a>;
}

/// Remote results gathered before a switch.
#[derive(Debug, Clone, Default)]
pub struct SwitchRefresh {
    pub tokens: Option<RefreshedTokens>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSkip {
    pub email: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub imported_ids: Vec<String>,
    pub skipped: Vec<ImportSkip>,
    pub tags_added: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaAlert {
    pub account_id: String,
    pub email: String,
    pub bucket: QuotaBucket,
    pub used: i64,
    pub total: i64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountStats {
    pub total: usize,
    pub active_account_id: Option<String>,
    pub by_subscription: BTreeMap<String, usize>,
    pub by_login_method: BTreeMap<String, usize>,
    pub by_provider: BTreeMap<String, usize>,
    pub expired_tokens: usize,
    pub quota_used: i64,
    pub quota_total: i64,
}

fn validate_email(raw: &str) -> AppResult<String> {
    let email = raw.trim();
    if email.is_empty() {
        return Err(AppError::invalid_input("email is required"));
    }
    if !email.contains('@') {
        return Err(AppError::invalid_input(format!("invalid email: {email}")));
    }
    Ok(email.to_string())
}

fn validate_id(raw: &str) -> AppResult<&str> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(AppError::invalid_input("account id is required"));
    }
    Ok(id)
}

fn normalize_tag_names(tags: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    tags.iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.to_string()))
        .map(str::to_string)
        .collect()
}

fn latest_last_used(state: &RegistrySnapshot) -> Option<DateTime<Utc>> {
    state.accounts.iter().map(|a| a.last_used).max()
}

fn next_last_used(state: &RegistrySnapshot) -> DateTime<Utc> {
    strictly_after(latest_last_used(state), now_utc())
}

fn find_index(state: &RegistrySnapshot, id: &str) -> AppResult<usize> {
    state
        .accounts
        .iter()
        .position(|a| a.id == id)
        .ok_or_else(|| AppError::not_found(format!("account {id} not found")))
}

fn email_taken(state: &RegistrySnapshot, email: &str) -> bool {
    let wanted = normalize_email(email);
    state
        .accounts
        .iter()
        .any(|a| normalize_email(&a.email) == wanted)
}

/// Registers tag definitions for names used by records but not yet defined.
fn ensure_tag_definitions<'a>(
    state: &mut RegistrySnapshot,
    names: impl IntoIterator<Item = &'a String>,
) -> usize {
    let mut added = 0;
    for name in names {
        if !state.tags.iter().any(|t| &t.name == name) {
            state.tags.push(Tag::new(name.clone()));
            added += 1;
        }
    }
    added
}

/// Activates the record at `index` (if any) and clears every other active flag.
fn set_active(state: &mut RegistrySnapshot, index: Option<usize>) {
    for (i, account) in state.accounts.iter_mut().enumerate() {
        account.is_active = Some(i) == index;
    }
    state.active_account_id = index.map(|i| state.accounts[i].id.clone());
}

/// Restores the single-active invariant on a freshly loaded snapshot.
fn repair_active(state: &mut RegistrySnapshot) -> bool {
    if state.accounts.is_empty() {
        let changed = state.active_account_id.is_some();
        state.active_account_id = None;
        return changed;
    }

    let by_pointer = state
        .active_account_id
        .as_deref()
        .and_then(|id| state.accounts.iter().position(|a| a.id == id));
    let by_flag = state.accounts.iter().position(|a| a.is_active);
    let index = by_pointer.or(by_flag).unwrap_or(0);

    let active_flags = state.accounts.iter().filter(|a| a.is_active).count();
    let consistent = active_flags == 1
        && state.accounts[index].is_active
        && state.active_account_id.as_deref() == Some(state.accounts[index].id.as_str());
    if consistent {
        return false;
    }
    set_active(state, Some(index));
    true
}

/// Removes the given ids (all known) and re-points the active account when needed.
fn remove_ids(state: &mut RegistrySnapshot, ids: &HashSet<&str>) {
    let removed_active = state
        .active_account_id
        .as_deref()
        .is_some_and(|id| ids.contains(id));
    state.accounts.retain(|a| !ids.contains(a.id.as_str()));

    if removed_active {
        let next = if state.accounts.is_empty() { None } else { Some(0) };
        set_active(state, next);
        if let Some(id) = &state.active_account_id {
            tracing::info!(account_id = %id, "active account removed; activated first remaining account");
        }
    }
}

pub struct CredentialRegistry {
    state: RwLock<RegistrySnapshot>,
    store: Arc<dyn SnapshotStore>,
    integration: Arc<dyn SystemIntegration>,
}

impl CredentialRegistry {
    /// Loads the persisted snapshot (or starts empty) and repairs invariants.
    pub fn open(
        store: Arc<dyn SnapshotStore>,
        integration: Arc<dyn SystemIntegration>,
    ) -> AppResult<Self> {
        let mut snapshot = store.load()?.unwrap_or_default();
        if snapshot.settings.sanitize() {
            tracing::info!("stored settings were out of range and have been sanitized");
        }
        if repair_active(&mut snapshot) {
            tracing::warn!(
                active_account_id = ?snapshot.active_account_id,
                "repaired active account pointer on load"
            );
        }
        store.set_backup_policy(snapshot.settings.backup_policy());
        tracing::info!(accounts = snapshot.accounts.len(), "credential registry loaded");

        Ok(Self {
            state: RwLock::new(snapshot),
            store,
            integration,
        })
    }

    fn mutate<T>(
        &self,
        label: &'static str,
        op: impl FnOnce(&mut RegistrySnapshot) -> AppResult<T>,
    ) -> AppResult<T> {
        self.mutate_if(label, |state| op(state).map(|value| (value, true)))
    }

    /// Like `mutate`, but the closure decides whether anything needs persisting.
    fn mutate_if<T>(
        &self,
        label: &'static str,
        op: impl FnOnce(&mut RegistrySnapshot) -> AppResult<(T, bool)>,
    ) -> AppResult<T> {
        let mut state = self.state.write_or_recover();
        let previous = state.clone();

        let (value, persist) = match op(&mut state) {
            Ok(v) => v,
            Err(err) => {
                *state = previous;
                return Err(err);
            }
        };
        if !persist {
            *state = previous;
            return Ok(value);
        }

        state.last_updated = now_utc();
        if let Err(err) = self.store.save(&state) {
            tracing::error!(op = label, "persisting registry failed, rolled back: {err}");
            *state = previous;
            return Err(err);
        }
        Ok(value)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.state.read_or_recover().clone()
    }

    pub fn list_accounts(&self) -> Vec<CredentialRecord> {
        self.state.read_or_recover().accounts.clone()
    }

    pub fn account_count(&self) -> usize {
        self.state.read_or_recover().accounts.len()
    }

    pub fn get_account(&self, id: &str) -> AppResult<CredentialRecord> {
        let id = validate_id(id)?;
        let state = self.state.read_or_recover();
        let index = find_index(&state, id)?;
        Ok(state.accounts[index].clone())
    }

    pub fn get_active_account(&self) -> Option<CredentialRecord> {
        let state = self.state.read_or_recover();
        let id = state.active_account_id.as_deref()?;
        state.accounts.iter().find(|a| a.id == id).cloned()
    }

    pub fn find_by_email(&self, email: &str) -> Option<CredentialRecord> {
        let wanted = normalize_email(email);
        self.state
            .read_or_recover()
            .accounts
            .iter()
            .find(|a| normalize_email(&a.email) == wanted)
            .cloned()
    }

    pub fn add_account(&self, mut record: CredentialRecord) -> AppResult<CredentialRecord> {
        record.email = validate_email(&record.email)?;
        record.id = record.id.trim().to_string();

        self.mutate("add_account", |state| {
            if email_taken(state, &record.email) {
                return Err(AppError::conflict(format!(
                    "account with email {} already exists",
                    record.email
                )));
            }
            if record.id.is_empty() {
                record.id = generate_account_id();
            } else if state.accounts.iter().any(|a| a.id == record.id) {
                return Err(AppError::conflict(format!(
                    "account id {} already exists",
                    record.id
                )));
            }

            let now = next_last_used(state);
            record.created_at = now;
            record.last_used = now;
            record.tags = normalize_tag_names(&record.tags);
            ensure_tag_definitions(state, record.tags.iter());

            let first = state.accounts.is_empty();
            record.is_active = false;
            state.accounts.push(record.clone());
            if first {
                set_active(state, Some(state.accounts.len() - 1));
                record.is_active = true;
            }
            Ok(record)
        })
        .inspect(|added| {
            tracing::info!(
                account_id = %added.id,
                login_method = added.login_method.as_str(),
                active = added.is_active,
                "account added"
            );
        })
    }

    pub fn remove_account(&self, id: &str) -> AppResult<CredentialRecord> {
        let id = validate_id(id)?;
        self.mutate("remove_account", |state| {
            let index = find_index(state, id)?;
            if state.accounts.len() == 1 {
                return Err(AppError::conflict("cannot remove the only active account"));
            }
            let removed = state.accounts[index].clone();
            remove_ids(state, &HashSet::from([id]));
            Ok(removed)
        })
        .inspect(|removed| tracing::info!(account_id = %removed.id, "account removed"))
    }

    pub fn batch_delete_accounts(&self, ids: &[String]) -> AppResult<BatchResult> {
        let unique: HashSet<&str> = ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .collect();
        if unique.is_empty() {
            return Err(AppError::invalid_input("no account ids given"));
        }

        self.mutate("batch_delete_accounts", |state| {
            if let Some(missing) = unique
                .iter()
                .find(|id| !state.accounts.iter().any(|a| a.id == **id))
            {
                return Err(AppError::not_found(format!("account {missing} not found")));
            }
            if unique.len() >= state.accounts.len() {
                return Err(AppError::conflict(
                    "cannot delete every account; at least one must remain active",
                ));
            }
            remove_ids(state, &unique);

            let mut result = BatchResult::new(unique.len());
            result.success_count = unique.len();
            Ok(result)
        })
        .inspect(|result| tracing::info!(count = result.success_count, "accounts batch deleted"))
    }

    pub fn update_account(&self, id: &str, update: AccountUpdate) -> AppResult<CredentialRecord> {
        let id = validate_id(id)?;
        if update.is_empty() {
            return Err(AppError::invalid_input("update contains no fields"));
        }
        if update.bearer_token.as_ref().is_some_and(SecretToken::is_empty) {
            return Err(AppError::invalid_input("bearer token must not be empty"));
        }

        self.mutate("update_account", |state| {
            let index = find_index(state, id)?;
            let AccountUpdate {
                display_name,
                avatar,
                tags,
                notes,
                bearer_token,
                refresh_token,
                token_expiry,
                quota,
                subscription_type,
            } = update;

            if let Some(tags) = &tags {
                let tags = normalize_tag_names(tags);
                ensure_tag_definitions(state, tags.iter());
                state.accounts[index].tags = tags;
            }

            let record = &mut state.accounts[index];
            if let Some(v) = display_name {
                record.display_name = v.trim().to_string();
            }
            if let Some(v) = avatar {
                record.avatar = v.trim().to_string();
            }
            if let Some(v) = notes {
                record.notes = v;
            }
            if let Some(v) = bearer_token {
                record.bearer_token = v;
            }
            if let Some(v) = refresh_token {
                record.refresh_token = v;
            }
            if let Some(v) = token_expiry {
                record.token_expiry = Some(v);
            }
            if let Some(v) = quota {
                record.quota = v;
            }
            if let Some(v) = subscription_type {
                record.subscription_type = v;
            }
            Ok(record.clone())
        })
    }

    pub fn switch_account(&self, id: &str) -> AppResult<CredentialRecord> {
        self.switch_account_refreshed(id, SwitchRefresh::default())
    }

    /// Activates `id`, folding in tokens and identity fetched just before the switch.
    pub fn switch_account_refreshed(
        &self,
        id: &str,
        refresh: SwitchRefresh,
    ) -> AppResult<CredentialRecord> {
        let id = validate_id(id)?;
        let (activated, change_machine_id) = self.mutate("switch_account", |state| {
            let index = find_index(state, id)?;
            let last_used = next_last_used(state);
            set_active(state, Some(index));
            let record = &mut state.accounts[index];
            record.last_used = last_used;
            if let Some(tokens) = refresh.tokens {
                apply_tokens(record, tokens);
            }
            if let Some(user_id) = refresh.user_id.filter(|u| !u.trim().is_empty()) {
                record.user_id = Some(user_id);
            }
            Ok((record.clone(), state.settings.auto_change_machine_id))
        })?;

        tracing::info!(account_id = %activated.id, "switched active account");
        propagate_switch(self.integration.as_ref(), &activated, change_machine_id);
        Ok(activated)
    }

    /// Refreshes tokens for `ids` concurrently without holding the registry lock, then persists once.
    pub async fn batch_refresh_tokens(
        self: &Arc<Self>,
        ids: &[String],
        refresher: Arc<dyn TokenRefresher>,
    ) -> AppResult<BatchResult> {
        let mut result = BatchResult::new(ids.len());
        let mut jobs = Vec::new();
        {
            let state = self.state.read_or_recover();
            for (order, raw_id) in ids.iter().enumerate() {
                let id = raw_id.trim();
                match state.accounts.iter().find(|a| a.id == id) {
                    None => result.record_error(id, AppError::not_found("account not found")),
                    Some(a) if a.refresh_token.is_empty() => result.record_error(
                        id,
                        AppError::invalid_input("account has no refresh token"),
                    ),
                    Some(a) => jobs.push((order, a.id.clone(), a.refresh_token.clone())),
                }
            }
        }

        let mut tasks = tokio::task::JoinSet::new();
        for (order, id, refresh_token) in jobs.iter().cloned() {
            let refresher = Arc::clone(&refresher);
            tasks.spawn(async move {
                let outcome = refresher.refresh_tokens(refresh_token.expose()).await;
                (order, id, outcome)
            });
        }

        let mut outcomes: Vec<(usize, String, AppResult<RefreshedTokens>)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => tracing::error!("token refresh task failed: {err}"),
            }
        }
        for (order, id, _) in &jobs {
            if !outcomes.iter().any(|(o, _, _)| o == order) {
                outcomes.push((
                    *order,
                    id.clone(),
                    Err(AppError::new("TASK_JOIN", "token refresh task failed")),
                ));
            }
        }
        outcomes.sort_by_key(|(order, _, _)| *order);

        let mut refreshed = Vec::new();
        for (_, id, outcome) in outcomes {
            match outcome {
                Ok(tokens) => refreshed.push((id, tokens)),
                Err(err) => {
                    tracing::warn!(account_id = %id, "token refresh failed: {err}");
                    result.record_error(id, err);
                }
            }
        }

        if !refreshed.is_empty() {
            let registry = Arc::clone(self);
            let (applied, missing) = blocking::run("registry.batch_refresh_apply", move || {
                registry.apply_refreshed_batch(refreshed)
            })
            .await?;
            result.success_count = applied;
            for id in missing {
                result.record_error(id, AppError::not_found("account removed during refresh"));
            }
        }

        tracing::info!(
            success = result.success_count,
            total = result.total_count,
            "batch token refresh finished"
        );
        Ok(result)
    }

    fn apply_refreshed_batch(
        &self,
        refreshed: Vec<(String, RefreshedTokens)>,
    ) -> AppResult<(usize, Vec<String>)> {
        self.mutate_if("batch_refresh_tokens", |state| {
            let mut applied = 0;
            let mut missing = Vec::new();
            for (id, tokens) in refreshed {
                match state.accounts.iter_mut().find(|a| a.id == id) {
                    Some(record) => {
                        apply_tokens(record, tokens);
                        applied += 1;
                    }
                    None => missing.push(id),
                }
            }
            Ok(((applied, missing), applied > 0))
        })
    }

    pub fn apply_refreshed_tokens(&self, id: &str, tokens: RefreshedTokens) -> AppResult<CredentialRecord> {
        let id = validate_id(id)?;
        if tokens.bearer_token.is_empty() {
            return Err(AppError::invalid_input("refreshed bearer token is empty"));
        }
        self.mutate("apply_refreshed_tokens", |state| {
            let index = find_index(state, id)?;
            apply_tokens(&mut state.accounts[index], tokens);
            Ok(state.accounts[index].clone())
        })
    }

    pub fn apply_quota(
        &self,
        id: &str,
        quota: QuotaInfo,
        subscription: Option<SubscriptionType>,
    ) -> AppResult<CredentialRecord> {
        let id = validate_id(id)?;
        self.mutate("apply_quota", |state| {
            let index = find_index(state, id)?;
            let record = &mut state.accounts[index];
            record.quota = quota;
            if let Some(tier) = subscription {
                record.subscription_type = tier;
            }
            Ok(record.clone())
        })
    }

    pub fn batch_add_tags(&self, ids: &[String], tags: &[String]) -> AppResult<BatchResult> {
        let tags = normalize_tag_names(tags);
        self.mutate_if("batch_add_tags", |state| {
            let mut result = BatchResult::new(ids.len());
            for raw_id in ids {
                let id = raw_id.trim();
                if tags.is_empty() {
                    result.record_error(id, AppError::invalid_input("no tags given"));
                    continue;
                }
                let Some(record) = state.accounts.iter_mut().find(|a| a.id == id) else {
                    result.record_error(id, AppError::not_found(format!("account {id} not found")));
                    continue;
                };
                record.add_tags(tags.iter().map(String::as_str));
                result.success_count += 1;
            }
            if result.success_count > 0 {
                ensure_tag_definitions(state, tags.iter());
            }
            let persist = result.success_count > 0;
            Ok((result, persist))
        })
    }

    pub fn list_tags(&self) -> Vec<Tag> {
        self.state.read_or_recover().tags.clone()
    }

    pub fn create_tag(&self, mut tag: Tag) -> AppResult<Tag> {
        tag.name = tag.name.trim().to_string();
        if tag.name.is_empty() {
            return Err(AppError::invalid_input("tag name is required"));
        }
        if tag.color.trim().is_empty() {
            return Err(AppError::invalid_input("tag color is required"));
        }
        self.mutate("create_tag", |state| {
            if state.tags.iter().any(|t| t.name == tag.name) {
                return Err(AppError::conflict(format!("tag {} already exists", tag.name)));
            }
            state.tags.push(tag.clone());
            Ok(tag)
        })
    }

    /// Updates a tag definition; a rename is applied to every record carrying the tag.
    pub fn update_tag(&self, name: &str, patch: TagPatch) -> AppResult<Tag> {
        let name = name.trim();
        let new_name = patch
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| *n != name)
            .map(str::to_string);
        if new_name.as_deref() == Some("") {
            return Err(AppError::invalid_input("tag name is required"));
        }

        self.mutate("update_tag", |state| {
            let index = state
                .tags
                .iter()
                .position(|t| t.name == name)
                .ok_or_else(|| AppError::not_found(format!("tag {name} not found")))?;

            if let Some(new_name) = &new_name {
                if state.tags.iter().any(|t| &t.name == new_name) {
                    return Err(AppError::conflict(format!("tag {new_name} already exists")));
                }
                for record in state.accounts.iter_mut() {
                    for tag in record.tags.iter_mut().filter(|t| t.as_str() == name) {
                        *tag = new_name.clone();
                    }
                }
                state.tags[index].name = new_name.clone();
            }

            let tag = &mut state.tags[index];
            if let Some(color) = patch.color.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
                tag.color = color.to_string();
            }
            if let Some(description) = patch.description {
                let description = description.trim().to_string();
                tag.description = (!description.is_empty()).then_some(description);
            }
            Ok(tag.clone())
        })
    }

    /// Deletes a tag definition and strips it from every record.
    pub fn delete_tag(&self, name: &str) -> AppResult<usize> {
        let name = name.trim();
        self.mutate("delete_tag", |state| {
            let before = state.tags.len();
            state.tags.retain(|t| t.name != name);
            if state.tags.len() == before {
                return Err(AppError::not_found(format!("tag {name} not found")));
            }
            let affected = state
                .accounts
                .iter_mut()
                .map(|a| a.remove_tag(name))
                .filter(|removed| *removed)
                .count();
            Ok(affected)
        })
    }

    pub fn add_tags_to_account(&self, id: &str, tags: &[String]) -> AppResult<CredentialRecord> {
        let id = validate_id(id)?;
        let tags = normalize_tag_names(tags);
        if tags.is_empty() {
            return Err(AppError::invalid_input("no tags given"));
        }
        self.mutate("add_tags_to_account", |state| {
            let index = find_index(state, id)?;
            state.accounts[index].add_tags(tags.iter().map(String::as_str));
            ensure_tag_definitions(state, tags.iter());
            Ok(state.accounts[index].clone())
        })
    }

    pub fn remove_tags_from_account(&self, id: &str, tags: &[String]) -> AppResult<CredentialRecord> {
        let id = validate_id(id)?;
        let tags = normalize_tag_names(tags);
        self.mutate("remove_tags_from_account", |state| {
            let index = find_index(state, id)?;
            let record = &mut state.accounts[index];
            for tag in &tags {
                record.remove_tag(tag);
            }
            Ok(record.clone())
        })
    }

    pub fn accounts_by_tag(&self, tag: &str) -> Vec<CredentialRecord> {
        let tag = tag.trim();
        self.state
            .read_or_recover()
            .accounts
            .iter()
            .filter(|a| a.has_tag(tag))
            .cloned()
            .collect()
    }

    pub fn settings(&self) -> VaultSettings {
        self.state.read_or_recover().settings.clone()
    }

    pub fn update_settings(&self, settings: VaultSettings) -> AppResult<VaultSettings> {
        settings.validate()?;
        let saved = self.mutate("update_settings", |state| {
            state.settings = settings;
            Ok(state.settings.clone())
        })?;
        self.store.set_backup_policy(saved.backup_policy());
        Ok(saved)
    }

    pub fn account_stats(&self) -> AccountStats {
        let state = self.state.read_or_recover();
        let now = now_utc();
        let mut stats = AccountStats {
            total: state.accounts.len(),
            active_account_id: state.active_account_id.clone(),
            ..AccountStats::default()
        };
        for account in &state.accounts {
            *stats
                .by_subscription
                .entry(account.subscription_type.as_str().to_string())
                .or_default() += 1;
            *stats
                .by_login_method
                .entry(account.login_method.as_str().to_string())
                .or_default() += 1;
            let provider = account.provider.map(|p| p.as_str()).unwrap_or("none");
            *stats.by_provider.entry(provider.to_string()).or_default() += 1;
            if account.is_token_expired(now) {
                stats.expired_tokens += 1;
            }
            stats.quota_used += account.quota.total_used();
            stats.quota_total += account.quota.total_limit();
        }
        stats
    }

    pub fn quota_alerts(&self, threshold: f64) -> Vec<QuotaAlert> {
        let state = self.state.read_or_recover();
        state
            .accounts
            .iter()
            .flat_map(|account| {
                account
                    .quota
                    .buckets()
                    .into_iter()
                    .filter(|(_, detail)| detail.is_low(threshold))
                    .map(|(bucket, detail)| QuotaAlert {
                        account_id: account.id.clone(),
                        email: account.email.clone(),
                        bucket,
                        used: detail.used,
                        total: detail.total,
                        percentage: detail.usage_percentage(),
                    })
            })
            .collect()
    }

    /// Exported data carries accounts (without tokens), tags and settings.
    pub fn export_accounts(&self, password: Option<&str>) -> AppResult<Vec<u8>> {
        let snapshot = self.snapshot();
        check_export_password(&snapshot, password)?;
        let bytes = store::encode_export(&snapshot, password)?;
        tracing::info!(
            accounts = snapshot.accounts.len(),
            encrypted = password.is_some(),
            "accounts exported"
        );
        Ok(bytes)
    }

    pub fn import_accounts(&self, data: &[u8], password: Option<&str>) -> AppResult<ImportReport> {
        let incoming = store::decode_export(data, password)?;
        self.import_snapshot(incoming)
    }

    /// Writes an export file through the store; returns the number of bytes written.
    pub fn export_to_file(&self, path: &Path, password: Option<&str>) -> AppResult<usize> {
        let snapshot = self.snapshot();
        check_export_password(&snapshot, password)?;
        self.store.export_to_file(&snapshot, path, password)
    }

    pub fn import_from_file(&self, path: &Path, password: Option<&str>) -> AppResult<ImportReport> {
        let incoming = self.store.import_from_file(path, password)?;
        self.import_snapshot(incoming)
    }

    fn import_snapshot(&self, incoming: RegistrySnapshot) -> AppResult<ImportReport> {
        self.mutate_if("import_accounts", |state| {
            let mut report = ImportReport::default();
            let was_empty = state.accounts.is_empty();

            for mut record in incoming.accounts {
                let email = match validate_email(&record.email) {
                    Ok(email) => email,
                    Err(err) => {
                        report.skipped.push(ImportSkip {
                            email: record.email.clone(),
                            reason: err.message().to_string(),
                        });
                        continue;
                    }
                };
                if email_taken(state, &email) {
                    report.skipped.push(ImportSkip {
                        email,
                        reason: "duplicate email".to_string(),
                    });
                    continue;
                }

                record.email = email;
                record.id = generate_account_id();
                record.is_active = false;
                record.last_used = next_last_used(state);
                record.tags = normalize_tag_names(&record.tags);
                report.tags_added += ensure_tag_definitions(state, record.tags.iter());
                report.imported_ids.push(record.id.clone());
                state.accounts.push(record);
            }

            for tag in incoming.tags {
                if !state.tags.iter().any(|t| t.name == tag.name) {
                    state.tags.push(tag);
                    report.tags_added += 1;
                }
            }

            if was_empty && !state.accounts.is_empty() {
                set_active(state, Some(0));
            }
            let persist = !report.imported_ids.is_empty() || report.tags_added > 0;
            Ok((report, persist))
        })
        .inspect(|report| {
            tracing::info!(
                imported = report.imported_ids.len(),
                skipped = report.skipped.len(),
                "accounts imported"
            );
        })
    }

    pub fn create_backup(&self) -> AppResult<BackupInfo> {
        let _guard = self.state.read_or_recover();
        self.store.create_backup()
    }

    pub fn list_backups(&self) -> AppResult<Vec<BackupInfo>> {
        self.store.list_backups()
    }

    pub fn validate_integrity(&self) -> AppResult<IntegrityReport> {
        let _guard = self.state.read_or_recover();
        self.store.validate_integrity()
    }

    /// Restores a backup file and reloads the in-memory state from it.
    pub fn restore_from_backup(&self, name: &str) -> AppResult<RegistrySnapshot> {
        let mut state = self.state.write_or_recover();
        let mut restored = self.store.restore_from_backup(name)?;
        restored.settings.sanitize();
        repair_active(&mut restored);
        self.store.set_backup_policy(restored.settings.backup_policy());
        *state = restored.clone();
        tracing::info!(backup = name, accounts = restored.accounts.len(), "registry reloaded from backup");
        Ok(restored)
    }
}

fn check_export_password(snapshot: &RegistrySnapshot, password: Option<&str>) -> AppResult<()> {
    let missing = password.map_or(true, |p| p.is_empty());
    if snapshot.settings.export_encryption && missing {
        return Err(AppError::invalid_input(
            "export encryption is enabled; a password is required",
        ));
    }
    Ok(())
}

fn apply_tokens(record: &mut CredentialRecord, tokens: RefreshedTokens) {
    let RefreshedTokens {
        bearer_token,
        refresh_token,
        token_expiry,
        profile_arn,
    } = tokens;
    record.bearer_token = bearer_token;
    if let Some(refresh) = refresh_token.filter(|t| !t.is_empty()) {
        record.refresh_token = refresh;
    }
    if token_expiry.is_some() {
        record.token_expiry = token_expiry;
    }
    if let Some(arn) = profile_arn {
        record.profile_arn = Some(arn);
    }
}
