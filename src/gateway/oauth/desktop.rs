//! Usage: Desktop auth service backend (`/login` redirect + JSON `/oauth/token` exchange).

use crate::gateway::http_errors::{format_error, parse_i64_lossy, read_json, transport_error};
use crate::gateway::oauth::backend::{
    AuthorizeRequest, BackendFuture, BackendKind, ExchangeRequest, ExchangedTokens, TokenBackend,
};
use crate::gateway::token_client::DesktopTokenResponse;
use crate::infra::api_config::ApiConfig;
use crate::shared::error::{AppError, AppResult};
use crate::shared::security::SecretToken;
use reqwest::Url;
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
struct TokenRequest<'a> {
    code: &'a str,
    code_verifier: &'a str,
    redirect_uri: &'a str,
}

pub struct DesktopBackend {
    client: reqwest::Client,
    config: Arc<ApiConfig>,
}

impl DesktopBackend {
    pub fn new(client: reqwest::Client, config: Arc<ApiConfig>) -> Self {
        Self { client, config }
    }

    pub fn login_url(&self, req: &AuthorizeRequest) -> AppResult<String> {
        let base = format!("{}/login", self.config.auth_endpoint);
        let url = Url::parse_with_params(
            &base,
            &[
                ("idp", req.provider.idp_name()),
                ("redirect_uri", req.redirect_uri.as_str()),
                ("code_challenge", req.code_challenge.as_str()),
                ("code_challenge_method", "S256"),
                ("state", req.state.as_str()),
            ],
        )
        .map_err(|e| AppError::invalid_input(format!("invalid auth endpoint: {e}")))?;
        Ok(url.to_string())
    }

    async fn exchange(&self, req: &ExchangeRequest) -> AppResult<ExchangedTokens> {
        let url = format!("{}/oauth/token", self.config.auth_endpoint);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&TokenRequest {
                code: req.code.trim(),
                code_verifier: &req.code_verifier,
                redirect_uri: &req.redirect_uri,
            })
            .send()
            .await
            .map_err(|e| transport_error("token exchange", e))?;
        let body: DesktopTokenResponse = read_json("token exchange", response).await?;

        let access = body.access_token.trim();
        if access.is_empty() {
            return Err(format_error("token exchange", "missing accessToken"));
        }
        let refresh = body.refresh_token.as_deref().map(str::trim).unwrap_or_default();
        if refresh.is_empty() {
            tracing::warn!(provider = req.provider.as_str(), "token exchange returned no refresh token");
        }
        Ok(ExchangedTokens {
            access_token: SecretToken::new(access),
            refresh_token: SecretToken::new(refresh),
            csrf_token: None,
            expires_in: body.expires_in.as_ref().and_then(parse_i64_lossy).unwrap_or(0),
            profile_arn: body
                .profile_arn
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty()),
            idp: Some(req.provider.idp_name().to_string()),
        })
    }
}

impl TokenBackend for DesktopBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Desktop
    }

    fn authorize_url<'a>(&'a self, req: &'a AuthorizeRequest) -> BackendFuture<'a, String> {
        Box::pin(async move { self.login_url(req) })
    }

    fn exchange_code<'a>(&'a self, req: &'a ExchangeRequest) -> BackendFuture<'a, ExchangedTokens> {
        Box::pin(self.exchange(req))
    }
}
