//! Usage: Public test helpers for unit and integration tests (in-memory stores, recording integration,
//! canned login backend and usage fetcher).

use crate::domain::accounts::{CredentialRecord, QuotaDetail, RegistrySnapshot, SubscriptionType};
use crate::domain::integration::SystemIntegration;
use crate::domain::registry::{RefreshFuture, RefreshedTokens, TokenRefresher};
use crate::gateway::oauth::backend::{
    AuthorizeRequest, BackendFuture, BackendKind, ExchangeRequest, ExchangedTokens, TokenBackend,
};
use crate::gateway::usage::{UsageFetcher, UsageFuture, UsageSnapshot};
use crate::shared::security::SecretToken;
use crate::infra::settings::BackupPolicy;
use crate::infra::store::SnapshotStore;
use crate::shared::error::{AppError, AppResult};
use crate::shared::mutex_ext::MutexExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Keeps the last saved snapshot in memory and counts saves.
#[derive(Default)]
pub struct MemoryStore {
    saved: Mutex<Option<RegistrySnapshot>>,
    saves: AtomicUsize,
    policy: Mutex<BackupPolicy>,
}

impl MemoryStore {
    pub fn saved(&self) -> Option<RegistrySnapshot> {
        self.saved.lock_or_recover().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn policy(&self) -> BackupPolicy {
        *self.policy.lock_or_recover()
    }
}

impl SnapshotStore for MemoryStore {
    fn save(&self, snapshot: &RegistrySnapshot) -> AppResult<()> {
        *self.saved.lock_or_recover() = Some(snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load(&self) -> AppResult<Option<RegistrySnapshot>> {
        Ok(self.saved())
    }

    fn set_backup_policy(&self, policy: BackupPolicy) {
        *self.policy.lock_or_recover() = policy;
    }
}

/// A `MemoryStore` whose saves can be switched to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn saved(&self) -> Option<RegistrySnapshot> {
        self.inner.saved()
    }
}

impl SnapshotStore for FlakyStore {
    fn save(&self, snapshot: &RegistrySnapshot) -> AppResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::persistence("simulated disk failure"));
        }
        self.inner.save(snapshot)
    }

    fn load(&self) -> AppResult<Option<RegistrySnapshot>> {
        self.inner.load()
    }
}

/// Records the ids pushed through the integration hooks.
#[derive(Default)]
pub struct RecordingIntegration {
    applied: Mutex<Vec<String>>,
    external: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingIntegration {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Ids applied to the local system (machine id).
    pub fn applied_ids(&self) -> Vec<String> {
        self.applied.lock_or_recover().clone()
    }

    pub fn external_ids(&self) -> Vec<String> {
        self.external.lock_or_recover().clone()
    }
}

impl SystemIntegration for RecordingIntegration {
    fn apply_account_to_system(&self, record: &CredentialRecord) -> AppResult<()> {
        if self.fail {
            return Err(AppError::new("SYSTEM_ERROR", "simulated integration failure"));
        }
        self.applied.lock_or_recover().push(record.id.clone());
        Ok(())
    }

    fn apply_account_to_external_config(&self, record: &CredentialRecord) -> AppResult<()> {
        if self.fail {
            return Err(AppError::new("SYSTEM_ERROR", "simulated integration failure"));
        }
        self.external.lock_or_recover().push(record.id.clone());
        Ok(())
    }
}

/// Desktop-kind backend that accepts any code and hands out fixed tokens.
#[derive(Default)]
pub struct StaticBackend {
    exchanges: AtomicUsize,
}

impl StaticBackend {
    pub fn exchange_count(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }
}

impl TokenBackend for StaticBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Desktop
    }

    fn authorize_url<'a>(&'a self, req: &'a AuthorizeRequest) -> BackendFuture<'a, String> {
        Box::pin(async move { Ok(format!("https://auth.invalid/login?state={}", req.state)) })
    }

    fn exchange_code<'a>(&'a self, _req: &'a ExchangeRequest) -> BackendFuture<'a, ExchangedTokens> {
        Box::pin(async move {
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            Ok(ExchangedTokens {
                access_token: SecretToken::new("static-access-token-0123456789"),
                refresh_token: SecretToken::new("static-refresh-token-0123456789"),
                expires_in: 3600,
                ..ExchangedTokens::default()
            })
        })
    }
}

/// Token refresher that hands out fixed tokens and records the refresh tokens it saw.
#[derive(Default)]
pub struct StaticRefresher {
    seen: Mutex<Vec<String>>,
    fail: bool,
}

impl StaticRefresher {
    pub const PROFILE_ARN: &'static str = "arn:aws:codewhisperer:us-east-1:000000000000:profile/STATIC";

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn refreshed(&self) -> Vec<String> {
        self.seen.lock_or_recover().clone()
    }
}

impl TokenRefresher for StaticRefresher {
    fn refresh_tokens<'a>(&'a self, refresh_token: &'a str) -> RefreshFuture<'a> {
        Box::pin(async move {
            if self.fail {
                return Err(AppError::new("REMOTE_UNAUTHORIZED", "refresh token revoked"));
            }
            self.seen.lock_or_recover().push(refresh_token.to_string());
            Ok(RefreshedTokens {
                bearer_token: SecretToken::new("static-refreshed-access-token"),
                refresh_token: None,
                token_expiry: None,
                profile_arn: Some(Self::PROFILE_ARN.to_string()),
            })
        })
    }
}

/// Usage fetcher returning one fixed snapshot and recording the profile ARN of each call.
pub struct StaticUsage {
    snapshot: UsageSnapshot,
    calls: AtomicUsize,
    profiles: Mutex<Vec<Option<String>>>,
}

impl StaticUsage {
    pub fn new(snapshot: UsageSnapshot) -> Self {
        Self {
            snapshot,
            calls: AtomicUsize::new(0),
            profiles: Mutex::new(Vec::new()),
        }
    }

    /// Free tier, 100 of 500 main credits used.
    pub fn with_email(email: &str) -> Self {
        let mut snapshot = UsageSnapshot {
            email: Some(email.to_string()),
            subscription: SubscriptionType::Free,
            ..UsageSnapshot::default()
        };
        snapshot.quota.main = QuotaDetail::new(100, 500);
        Self::new(snapshot)
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn profile_arns(&self) -> Vec<Option<String>> {
        self.profiles.lock_or_recover().clone()
    }
}

impl UsageFetcher for StaticUsage {
    fn fetch_usage<'a>(&'a self, _bearer_token: &'a str, profile_arn: Option<&'a str>) -> UsageFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.profiles
                .lock_or_recover()
                .push(profile_arn.map(str::to_string));
            Ok(self.snapshot.clone())
        })
    }
}
