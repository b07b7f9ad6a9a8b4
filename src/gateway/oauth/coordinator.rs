//! Usage: Login flow state machine (start -> callback -> exchange -> profile -> account record).
//!
//! Pending logins are keyed by the random `state` parameter and are single-use: the first
//! `complete_flow`/`fail_flow` for a state removes it, whatever the outcome.

use crate::domain::accounts::{CredentialRecord, LoginMethod, OAuthProvider};
use crate::gateway::oauth::backend::{
    AuthorizeRequest, BackendKind, BackendProfile, ExchangeRequest, TokenBackend,
};
use crate::gateway::oauth::pkce::{generate_pkce_pair, generate_state};
use crate::gateway::usage::{UsageFetcher, UsageSnapshot};
use crate::infra::api_config::ApiConfig;
use crate::shared::error::{AppError, AppResult};
use crate::shared::mutex_ext::MutexExt;
use crate::shared::time::{expiry_from_expires_in, now_utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

pub const PENDING_LOGIN_TTL: Duration = Duration::from_secs(10 * 60);

struct PendingLogin {
    code_verifier: String,
    provider: OAuthProvider,
    backend: BackendKind,
    redirect_uri: String,
    created_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginStart {
    pub auth_url: String,
    pub state: String,
    pub redirect_uri: String,
    pub provider: OAuthProvider,
    pub backend: BackendKind,
}

pub struct OAuthCoordinator {
    config: Arc<ApiConfig>,
    backends: HashMap<BackendKind, Arc<dyn TokenBackend>>,
    usage: Arc<dyn UsageFetcher>,
    callback_port: AtomicU16,
    pending: Mutex<HashMap<String, PendingLogin>>,
    pending_ttl: Duration,
}

impl OAuthCoordinator {
    pub fn new(
        config: Arc<ApiConfig>,
        backends: Vec<Arc<dyn TokenBackend>>,
        usage: Arc<dyn UsageFetcher>,
    ) -> Self {
        let callback_port = AtomicU16::new(config.callback_port);
        Self {
            config,
            backends: backends.into_iter().map(|b| (b.kind(), b)).collect(),
            usage,
            callback_port,
            pending: Mutex::new(HashMap::new()),
            pending_ttl: PENDING_LOGIN_TTL,
        }
    }

    /// Port the loopback listener actually bound (may differ from the configured one).
    pub fn set_callback_port(&self, port: u16) {
        self.callback_port.store(port, Ordering::Relaxed);
    }

    pub fn callback_port(&self) -> u16 {
        self.callback_port.load(Ordering::Relaxed)
    }

    pub fn redirect_uri(&self) -> String {
        self.config.redirect_uri(self.callback_port())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock_or_recover().len()
    }

    fn backend(&self, kind: BackendKind) -> AppResult<&Arc<dyn TokenBackend>> {
        self.backends.get(&kind).ok_or_else(|| {
            AppError::invalid_input(format!("login backend {} is not configured", kind.as_str()))
        })
    }

    fn sweep_expired(&self) -> usize {
        let ttl = self.pending_ttl;
        let mut pending = self.pending.lock_or_recover();
        let before = pending.len();
        pending.retain(|_, login| login.created_at.elapsed() < ttl);
        before - pending.len()
    }

    fn take_pending(&self, state: &str) -> AppResult<PendingLogin> {
        let login = self
            .pending
            .lock_or_recover()
            .remove(state)
            .ok_or_else(|| AppError::not_found("login state is unknown or already used"))?;
        if login.created_at.elapsed() >= self.pending_ttl {
            return Err(AppError::not_found("login state has expired"));
        }
        Ok(login)
    }

    pub async fn start_flow(
        &self,
        provider: OAuthProvider,
        backend_kind: BackendKind,
    ) -> AppResult<LoginStart> {
        let backend = Arc::clone(self.backend(backend_kind)?);
        let swept = self.sweep_expired();
        if swept > 0 {
            tracing::debug!(swept, "dropped expired pending logins");
        }

        let pkce = generate_pkce_pair();
        let state = generate_state();
        let redirect_uri = self.redirect_uri();
        let auth_url = backend
            .authorize_url(&AuthorizeRequest {
                provider,
                redirect_uri: redirect_uri.clone(),
                code_challenge: pkce.code_challenge,
                state: state.clone(),
            })
            .await?;

        self.pending.lock_or_recover().insert(
            state.clone(),
            PendingLogin {
                code_verifier: pkce.code_verifier,
                provider,
                backend: backend_kind,
                redirect_uri: redirect_uri.clone(),
                created_at: Instant::now(),
            },
        );
        tracing::info!(
            provider = provider.as_str(),
            backend = backend_kind.as_str(),
            "login flow started"
        );

        Ok(LoginStart {
            auth_url,
            state,
            redirect_uri,
            provider,
            backend: backend_kind,
        })
    }

    /// Exchanges `code` and builds an inactive record; the caller decides whether to store it.
    pub async fn complete_flow(&self, state: &str, code: &str) -> AppResult<CredentialRecord> {
        let code = code.trim();
        if code.is_empty() {
            return Err(AppError::invalid_input("authorization code is empty"));
        }
        let login = self.take_pending(state)?;
        let backend = Arc::clone(self.backend(login.backend)?);

        let tokens = backend
            .exchange_code(&ExchangeRequest {
                provider: login.provider,
                code: code.to_string(),
                code_verifier: login.code_verifier,
                redirect_uri: login.redirect_uri,
                state: state.to_string(),
            })
            .await?;
        tracing::debug!(
            backend = login.backend.as_str(),
            token = %tokens.access_token.masked(),
            "authorization code exchanged"
        );

        let profile = match backend.fetch_profile(&tokens).await {
            Ok(profile) => profile,
            Err(err) => {
                tracing::warn!(backend = login.backend.as_str(), "profile fetch failed: {err}");
                BackendProfile::default()
            }
        };

        let usage = match self
            .usage
            .fetch_usage(tokens.access_token.expose(), tokens.profile_arn.as_deref())
            .await
        {
            Ok(usage) => usage,
            // Usage is only mandatory when it is the sole source of the email.
            Err(err) if profile.email.is_some() => {
                tracing::warn!("usage fetch after login failed: {err}");
                UsageSnapshot::default()
            }
            Err(err) => return Err(err),
        };

        let email = profile
            .email
            .or_else(|| usage.email.clone())
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .ok_or_else(|| AppError::new("REMOTE_FORMAT", "login completed without a user email"))?;

        let mut record = CredentialRecord::new(email.clone(), LoginMethod::Oauth);
        record.display_name = email;
        record.provider = Some(login.provider);
        record.bearer_token = tokens.access_token;
        record.refresh_token = tokens.refresh_token;
        record.token_expiry = expiry_from_expires_in(tokens.expires_in, now_utc());
        record.profile_arn = tokens.profile_arn;
        record.user_id = profile.user_id.or(usage.user_id);
        record.quota = usage.quota;
        record.subscription_type = usage.subscription;

        tracing::info!(
            provider = login.provider.as_str(),
            backend = login.backend.as_str(),
            subscription = record.subscription_type.as_str(),
            "login flow completed"
        );
        Ok(record)
    }

    /// Drops the pending login after the provider redirected with an error.
    pub fn fail_flow(&self, state: &str) -> bool {
        let removed = self.pending.lock_or_recover().remove(state).is_some();
        if removed {
            tracing::info!("login flow cancelled by provider");
        }
        removed
    }
}
