//! Usage: Kiro web portal backend (Smithy RPCv2 CBOR: `InitiateLogin`, `ExchangeToken`, `GetUserInfo`).
//!
//! The refresh token is not in the body: it arrives as the `RefreshToken` Set-Cookie on `ExchangeToken`.

use crate::gateway::http_errors::{format_error, status_error, transport_error};
use crate::gateway::oauth::backend::{
    AuthorizeRequest, BackendFuture, BackendKind, BackendProfile, ExchangeRequest, ExchangedTokens,
    TokenBackend,
};
use crate::infra::api_config::ApiConfig;
use crate::shared::error::AppResult;
use crate::shared::security::SecretToken;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, CONTENT_TYPE, COOKIE, SET_COOKIE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const CBOR_CONTENT_TYPE: &str = "application/cbor";
pub const SMITHY_PROTOCOL_HEADER: &str = "smithy-protocol";
pub const SMITHY_PROTOCOL: &str = "rpc-v2-cbor";
const SERVICE_PATH: &str = "/service/KiroWebPortalService/operation";
const USER_INFO_ORIGIN: &str = "KIRO_IDE";
pub const REFRESH_TOKEN_COOKIE: &str = "RefreshToken";
pub const IDP_COOKIE: &str = "Idp";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateLoginRequest {
    pub idp: String,
    pub redirect_uri: String,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub state: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateLoginResponse {
    #[serde(default)]
    pub redirect_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeTokenRequest {
    pub idp: String,
    pub code: String,
    pub code_verifier: String,
    pub redirect_uri: String,
    pub state: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeTokenResponse {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub csrf_token: Option<String>,
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default)]
    pub profile_arn: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetUserInfoRequest {
    pub origin: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetUserInfoResponse {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub idp: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

pub fn encode_cbor<T: Serialize>(value: &T) -> AppResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| crate::shared::error::AppError::new("SYSTEM_ERROR", format!("cbor encode failed: {e}")))?;
    Ok(buf)
}

/// Finds `name=value` among the response's Set-Cookie headers.
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|raw| raw.split(';').next())
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| k.trim() == name)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub struct WebPortalBackend {
    client: reqwest::Client,
    config: Arc<ApiConfig>,
}

impl WebPortalBackend {
    pub fn new(client: reqwest::Client, config: Arc<ApiConfig>) -> Self {
        Self { client, config }
    }

    async fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        operation: &str,
        body: &Req,
        extra_headers: HeaderMap,
    ) -> AppResult<(Resp, HeaderMap)> {
        let url = format!("{}{SERVICE_PATH}/{operation}", self.config.web_portal_endpoint);
        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, CBOR_CONTENT_TYPE)
            .header(ACCEPT, CBOR_CONTENT_TYPE)
            .header(SMITHY_PROTOCOL_HEADER, SMITHY_PROTOCOL)
            .headers(extra_headers)
            .body(encode_cbor(body)?)
            .send()
            .await
            .map_err(|e| transport_error(operation, e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(operation, e))?;
        if !status.is_success() {
            return Err(status_error(operation, status, &error_body_text(&bytes)));
        }
        let parsed: Resp =
            ciborium::from_reader(bytes.as_ref()).map_err(|e| format_error(operation, e))?;
        Ok((parsed, headers))
    }

    async fn initiate_login(&self, req: &AuthorizeRequest) -> AppResult<String> {
        let body = InitiateLoginRequest {
            idp: req.provider.idp_name().to_string(),
            redirect_uri: req.redirect_uri.clone(),
            code_challenge: req.code_challenge.clone(),
            code_challenge_method: "S256".to_string(),
            state: req.state.clone(),
        };
        let (resp, _): (InitiateLoginResponse, _) =
            self.call("InitiateLogin", &body, HeaderMap::new()).await?;
        let url = resp.redirect_url.trim();
        if url.is_empty() {
            return Err(format_error("InitiateLogin", "missing redirectUrl"));
        }
        Ok(url.to_string())
    }

    async fn exchange(&self, req: &ExchangeRequest) -> AppResult<ExchangedTokens> {
        let body = ExchangeTokenRequest {
            idp: req.provider.idp_name().to_string(),
            code: req.code.trim().to_string(),
            code_verifier: req.code_verifier.clone(),
            redirect_uri: req.redirect_uri.clone(),
            state: req.state.clone(),
        };
        let (resp, headers): (ExchangeTokenResponse, _) =
            self.call("ExchangeToken", &body, HeaderMap::new()).await?;

        let access = resp.access_token.trim();
        if access.is_empty() {
            return Err(format_error("ExchangeToken", "missing accessToken"));
        }
        let refresh = cookie_value(&headers, REFRESH_TOKEN_COOKIE).unwrap_or_default();
        if refresh.is_empty() {
            tracing::warn!("ExchangeToken response carried no RefreshToken cookie");
        }
        Ok(ExchangedTokens {
            access_token: SecretToken::new(access),
            refresh_token: SecretToken::new(refresh),
            csrf_token: resp
                .csrf_token
                .filter(|t| !t.trim().is_empty())
                .map(SecretToken::new),
            expires_in: resp.expires_in,
            profile_arn: resp.profile_arn.filter(|a| !a.trim().is_empty()),
            idp: cookie_value(&headers, IDP_COOKIE).or_else(|| Some(req.provider.idp_name().to_string())),
        })
    }

    async fn user_info(&self, tokens: &ExchangedTokens) -> AppResult<BackendProfile> {
        let mut headers = HeaderMap::new();
        let bearer = format!("Bearer {}", tokens.access_token.expose());
        let cookie = format!(
            "{IDP_COOKIE}={}; AccessToken={}",
            tokens.idp.as_deref().unwrap_or_default(),
            tokens.access_token.expose()
        );
        for (name, value) in [(AUTHORIZATION, bearer), (COOKIE, cookie)] {
            let value = value
                .parse()
                .map_err(|_| format_error("GetUserInfo", "token is not a valid header value"))?;
            headers.insert(name, value);
        }
        if let Some(csrf) = &tokens.csrf_token {
            if let Ok(value) = csrf.expose().parse() {
                headers.insert("x-csrf-token", value);
            }
        }

        let body = GetUserInfoRequest {
            origin: USER_INFO_ORIGIN.to_string(),
        };
        let (resp, _): (GetUserInfoResponse, _) = self.call("GetUserInfo", &body, headers).await?;
        if let Some(status) = resp.status.as_deref().filter(|s| !s.is_empty()) {
            tracing::debug!(status, "web portal user status");
        }
        Ok(BackendProfile {
            email: resp.email.filter(|e| !e.trim().is_empty()),
            user_id: resp.user_id.filter(|u| !u.trim().is_empty()),
        })
    }
}

fn error_body_text(bytes: &[u8]) -> String {
    match ciborium::from_reader::<ciborium::Value, _>(bytes) {
        Ok(value) => serde_json::to_string(&value).unwrap_or_default(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

impl TokenBackend for WebPortalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::WebPortal
    }

    fn authorize_url<'a>(&'a self, req: &'a AuthorizeRequest) -> BackendFuture<'a, String> {
        Box::pin(self.initiate_login(req))
    }

    fn exchange_code<'a>(&'a self, req: &'a ExchangeRequest) -> BackendFuture<'a, ExchangedTokens> {
        Box::pin(self.exchange(req))
    }

    fn fetch_profile<'a>(&'a self, tokens: &'a ExchangedTokens) -> BackendFuture<'a, BackendProfile> {
        Box::pin(self.user_info(tokens))
    }
}
