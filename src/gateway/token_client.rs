//! Usage: Desktop-auth token refresh/validation and static-token account creation.

use crate::domain::accounts::{CredentialRecord, LoginMethod};
use crate::domain::registry::{RefreshFuture, RefreshedTokens, TokenRefresher};
use crate::gateway::http_errors::{format_error, read_json, status_error, transport_error};
use crate::gateway::retry::{retry_with_backoff, RetryPolicy};
use crate::gateway::usage::UsageClient;
use crate::infra::api_config::ApiConfig;
use crate::shared::error::{AppError, AppResult};
use crate::shared::security::{mask_token, SecretToken};
use crate::shared::time::{expiry_from_expires_in, now_utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const MIN_TOKEN_LEN: usize = 20;
pub const MAX_TOKEN_LEN: usize = 4096;

/// Body shared by `/oauth/token` and `/refreshToken`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesktopTokenResponse {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<serde_json::Value>,
    #[serde(default)]
    pub profile_arn: Option<String>,
}

impl DesktopTokenResponse {
    pub fn into_tokens(self, what: &str) -> AppResult<RefreshedTokens> {
        let access = self.access_token.trim();
        if access.is_empty() {
            return Err(format_error(what, "missing accessToken"));
        }
        let expires_in = self
            .expires_in
            .as_ref()
            .and_then(crate::gateway::http_errors::parse_i64_lossy)
            .unwrap_or(0);
        Ok(RefreshedTokens {
            bearer_token: SecretToken::new(access),
            refresh_token: self
                .refresh_token
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .map(SecretToken::new),
            token_expiry: expiry_from_expires_in(expires_in, now_utc()),
            profile_arn: self
                .profile_arn
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty()),
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Length 20..=4096 and visible ASCII only.
pub fn validate_token_format(token: &str) -> AppResult<()> {
    let len = token.len();
    if !(MIN_TOKEN_LEN..=MAX_TOKEN_LEN).contains(&len) {
        return Err(AppError::invalid_input(format!(
            "token length must be within {MIN_TOKEN_LEN}..={MAX_TOKEN_LEN} characters (got {len})"
        )));
    }
    if !token.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(AppError::invalid_input(
            "token must contain only visible ASCII characters",
        ));
    }
    Ok(())
}

#[derive(Clone)]
pub struct TokenClient {
    client: reqwest::Client,
    config: Arc<ApiConfig>,
    usage: UsageClient,
    retry: RetryPolicy,
}

impl TokenClient {
    pub fn new(client: reqwest::Client, config: Arc<ApiConfig>) -> Self {
        let usage = UsageClient::new(client.clone(), Arc::clone(&config));
        Self {
            client,
            config,
            usage,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self.usage = self.usage.with_retry_policy(retry);
        self
    }

    pub fn usage_client(&self) -> &UsageClient {
        &self.usage
    }

    async fn refresh_once(&self, refresh_token: &str) -> AppResult<RefreshedTokens> {
        let url = format!("{}/refreshToken", self.config.auth_endpoint);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| transport_error("token refresh", e))?;
        let body: DesktopTokenResponse = read_json("token refresh", response).await?;
        body.into_tokens("token refresh")
    }

    pub async fn refresh(&self, refresh_token: &str) -> AppResult<RefreshedTokens> {
        let refresh_token = refresh_token.trim();
        if refresh_token.is_empty() {
            return Err(AppError::invalid_input("refresh token is required"));
        }
        tracing::debug!(refresh_token = %mask_token(refresh_token), "refreshing bearer token");
        retry_with_backoff("token refresh", self.retry, || self.refresh_once(refresh_token)).await
    }

    async fn validate_once(&self, bearer_token: &str) -> AppResult<bool> {
        let url = format!("{}/validateToken", self.config.auth_endpoint);
        let response = self
            .client
            .get(&url)
            .bearer_auth(bearer_token)
            .send()
            .await
            .map_err(|e| transport_error("token validation", e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        if matches!(
            status,
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN
        ) {
            return Ok(false);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error("token validation", status, &body))
    }

    /// `Ok(false)` when the service rejects the token; other failures are errors.
    pub async fn validate(&self, bearer_token: &str) -> AppResult<bool> {
        validate_token_format(bearer_token.trim())?;
        retry_with_backoff("token validation", self.retry, || {
            self.validate_once(bearer_token.trim())
        })
        .await
    }

    /// Builds an inactive `token`-method record from a pasted bearer (and optional refresh) token.
    pub async fn create_account_from_token(
        &self,
        bearer_token: &str,
        refresh_token: Option<&str>,
    ) -> AppResult<CredentialRecord> {
        let bearer_token = bearer_token.trim();
        validate_token_format(bearer_token)?;
        let refresh_token = refresh_token.map(str::trim).filter(|t| !t.is_empty());
        if let Some(refresh) = refresh_token {
            validate_token_format(refresh)?;
        }

        let mut tokens = RefreshedTokens {
            bearer_token: SecretToken::new(bearer_token),
            refresh_token: refresh_token.map(SecretToken::new),
            ..RefreshedTokens::default()
        };
        if let Some(refresh) = refresh_token {
            let refreshed = self.refresh(refresh).await?;
            tokens.bearer_token = refreshed.bearer_token;
            tokens.token_expiry = refreshed.token_expiry;
            tokens.profile_arn = refreshed.profile_arn;
            if refreshed.refresh_token.is_some() {
                tokens.refresh_token = refreshed.refresh_token;
            }
        }

        let usage = self
            .usage
            .fetch_snapshot(tokens.bearer_token.expose(), tokens.profile_arn.as_deref())
            .await?;
        let email = usage
            .email
            .clone()
            .ok_or_else(|| format_error("usage fetch", "response has no user email"))?;

        let mut record = CredentialRecord::new(email.clone(), LoginMethod::Token);
        record.display_name = email;
        record.bearer_token = tokens.bearer_token;
        record.refresh_token = tokens.refresh_token.unwrap_or_default();
        record.token_expiry = tokens.token_expiry;
        record.profile_arn = tokens.profile_arn;
        record.user_id = usage.user_id;
        record.quota = usage.quota;
        record.subscription_type = usage.subscription;
        tracing::info!(
            subscription = record.subscription_type.as_str(),
            "built account from static token"
        );
        Ok(record)
    }
}

impl TokenRefresher for TokenClient {
    fn refresh_tokens<'a>(&'a self, refresh_token: &'a str) -> RefreshFuture<'a> {
        Box::pin(self.refresh(refresh_token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_format_bounds_and_charset() {
        assert!(validate_token_format(&"a".repeat(MIN_TOKEN_LEN)).is_ok());
        assert!(validate_token_format(&"a".repeat(MIN_TOKEN_LEN - 1)).is_err());
        assert!(validate_token_format(&"a".repeat(MAX_TOKEN_LEN + 1)).is_err());
        assert!(validate_token_format("aoaAAAAAGg with a space inside").is_err());
        assert!(validate_token_format("aoaAAAAAGgé-not-ascii-token-value").is_err());
    }

    #[test]
    fn token_response_requires_access_token() {
        let empty: DesktopTokenResponse = serde_json::from_str("{}").expect("json");
        assert_eq!(
            empty.into_tokens("token refresh").expect_err("missing").code(),
            "REMOTE_FORMAT"
        );

        let body: DesktopTokenResponse = serde_json::from_str(
            r#"{"accessToken":"at","refreshToken":" ","expiresIn":"3600","profileArn":"arn:x"}"#,
        )
        .expect("json");
        let tokens = body.into_tokens("token refresh").expect("tokens");
        assert_eq!(tokens.bearer_token.expose(), "at");
        assert!(tokens.refresh_token.is_none());
        assert!(tokens.token_expiry.is_some());
        assert_eq!(tokens.profile_arn.as_deref(), Some("arn:x"));
    }
}
